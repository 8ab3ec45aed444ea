//! Seed-to-key algorithms and their registry
//!
//! The bundled algorithms are illustrative placeholders. Production keys are
//! manufacturer secrets; register the real ones under the manufacturer id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crc::{Crc, CRC_16_IBM_3740};

use super::SecurityError;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Computes the SecurityAccess key for a seed
pub trait KeyAlgorithm: Send + Sync {
    fn name(&self) -> &str;

    /// `level` is the odd requestSeed sub-function
    fn compute_key(&self, seed: &[u8], level: u8) -> Result<Vec<u8>, SecurityError>;
}

impl fmt::Debug for dyn KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyAlgorithm({})", self.name())
    }
}

fn seed_as_u32(seed: &[u8], algorithm: &str) -> Result<u32, SecurityError> {
    if seed.is_empty() || seed.len() > 4 {
        return Err(SecurityError::InvalidSeed(format!(
            "{} expects a 1-4 byte seed, got {}",
            algorithm,
            seed.len()
        )));
    }
    Ok(seed.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// Low `len` bytes of `value`, big-endian
fn u32_to_width(value: u32, len: usize) -> Vec<u8> {
    value.to_be_bytes()[4 - len..].to_vec()
}

/// Seed XOR a repeating mask
#[derive(Debug, Clone)]
pub struct XorAlgorithm {
    mask: Vec<u8>,
}

impl XorAlgorithm {
    pub fn new(mask: impl Into<Vec<u8>>) -> Self {
        Self { mask: mask.into() }
    }
}

impl KeyAlgorithm for XorAlgorithm {
    fn name(&self) -> &str {
        "xor"
    }

    fn compute_key(&self, seed: &[u8], _level: u8) -> Result<Vec<u8>, SecurityError> {
        if self.mask.is_empty() {
            return Err(SecurityError::InvalidSeed("xor mask is empty".to_string()));
        }
        Ok(seed
            .iter()
            .zip(self.mask.iter().cycle())
            .map(|(s, m)| s ^ m)
            .collect())
    }
}

/// Seed as a big-endian integer plus a constant, truncated to the seed width
#[derive(Debug, Clone, Copy)]
pub struct AdditiveAlgorithm {
    constant: u32,
}

impl AdditiveAlgorithm {
    pub fn new(constant: u32) -> Self {
        Self { constant }
    }
}

impl KeyAlgorithm for AdditiveAlgorithm {
    fn name(&self) -> &str {
        "additive"
    }

    fn compute_key(&self, seed: &[u8], _level: u8) -> Result<Vec<u8>, SecurityError> {
        let value = seed_as_u32(seed, self.name())?;
        Ok(u32_to_width(value.wrapping_add(self.constant), seed.len()))
    }
}

/// Seed XOR a CRC-16 computed over the seed and its own checksum
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc16Algorithm;

impl KeyAlgorithm for Crc16Algorithm {
    fn name(&self) -> &str {
        "crc16"
    }

    fn compute_key(&self, seed: &[u8], level: u8) -> Result<Vec<u8>, SecurityError> {
        let first = CRC16.checksum(seed);
        let mut digest = CRC16.digest();
        digest.update(seed);
        digest.update(&first.to_be_bytes());
        digest.update(&[level]);
        let crc = digest.finalize().to_be_bytes();
        Ok(seed
            .iter()
            .zip(crc.iter().cycle())
            .map(|(s, c)| s ^ c)
            .collect())
    }
}

/// Reverse the seed bytes, then XOR a 32-bit mask
#[derive(Debug, Clone, Copy)]
pub struct ByteSwapXorAlgorithm {
    mask: u32,
}

impl ByteSwapXorAlgorithm {
    pub fn new(mask: u32) -> Self {
        Self { mask }
    }
}

impl KeyAlgorithm for ByteSwapXorAlgorithm {
    fn name(&self) -> &str {
        "byteswap-xor"
    }

    fn compute_key(&self, seed: &[u8], _level: u8) -> Result<Vec<u8>, SecurityError> {
        let mask = self.mask.to_be_bytes();
        Ok(seed
            .iter()
            .rev()
            .zip(mask.iter().cycle())
            .map(|(s, m)| s ^ m)
            .collect())
    }
}

/// 24-bit Galois LFSR clocked by the seed bits, then by five constants
#[derive(Debug, Clone, Copy)]
pub struct Lfsr24Algorithm {
    constants: [u8; 5],
    initial: u32,
}

impl Lfsr24Algorithm {
    const TAPS: u32 = 0x10_9028;

    pub fn new(constants: [u8; 5]) -> Self {
        Self {
            constants,
            initial: 0xC5_41A9,
        }
    }

    fn clock(register: u32, input: u32) -> u32 {
        let feedback = (input ^ register) & 1;
        let shifted = register >> 1;
        if feedback == 1 {
            (shifted ^ Self::TAPS) | 0x80_0000
        } else {
            shifted
        }
    }
}

impl KeyAlgorithm for Lfsr24Algorithm {
    fn name(&self) -> &str {
        "lfsr24"
    }

    fn compute_key(&self, seed: &[u8], _level: u8) -> Result<Vec<u8>, SecurityError> {
        if seed.len() != 3 {
            return Err(SecurityError::InvalidSeed(format!(
                "lfsr24 expects a 3 byte seed, got {}",
                seed.len()
            )));
        }
        let seed_word = (u32::from(self.constants[0]) << 24) | seed_as_u32(seed, self.name())?;
        let constant_word = u32::from_be_bytes([
            self.constants[4],
            self.constants[3],
            self.constants[2],
            self.constants[1],
        ]);

        let mut register = self.initial;
        for word in [seed_word, constant_word] {
            for bit in 0..32 {
                register = Self::clock(register, word >> bit);
            }
        }
        Ok(u32_to_width(register & 0xFF_FFFF, 3))
    }
}

type KeyFn = dyn Fn(&[u8], u8) -> Vec<u8> + Send + Sync;

/// Arbitrary closure algorithm
pub struct FnAlgorithm {
    name: String,
    func: Box<KeyFn>,
}

impl FnAlgorithm {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[u8], u8) -> Vec<u8> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl KeyAlgorithm for FnAlgorithm {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute_key(&self, seed: &[u8], level: u8) -> Result<Vec<u8>, SecurityError> {
        Ok((self.func)(seed, level))
    }
}

/// Algorithms keyed by manufacturer id
///
/// Constructed explicitly and handed to the security manager; there is no
/// process-wide instance.
#[derive(Default, Clone)]
pub struct AlgorithmRegistry {
    algorithms: HashMap<String, Arc<dyn KeyAlgorithm>>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-filled with the placeholder algorithms
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("generic", Arc::new(XorAlgorithm::new([0x5A, 0xA5, 0x3C, 0xC3])));
        registry.register("xor", Arc::new(XorAlgorithm::new([0xFF])));
        registry.register("additive", Arc::new(AdditiveAlgorithm::new(0x1234_5678)));
        registry.register("crc16", Arc::new(Crc16Algorithm));
        registry.register("byteswap-xor", Arc::new(ByteSwapXorAlgorithm::new(0xA5A5_5A5A)));
        registry.register(
            "lfsr24",
            Arc::new(Lfsr24Algorithm::new([0x65, 0xF8, 0x24, 0xAC, 0x8F])),
        );
        registry
    }

    /// Add or replace the algorithm for `id`
    pub fn register(&mut self, id: impl Into<String>, algorithm: Arc<dyn KeyAlgorithm>) {
        self.algorithms.insert(id.into(), algorithm);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn KeyAlgorithm>> {
        self.algorithms.get(id).cloned()
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.algorithms.keys().cloned().collect();
        ids.sort();
        ids
    }
}
