//! Command implementations for opendiag

pub mod at;
pub mod control;
pub mod devices;
pub mod dtcs;
pub mod modules;
pub mod read;
pub mod unlock;

pub use at::at;
pub use control::{actuate, routine, write};
pub use devices::devices;
pub use dtcs::{clear_dtcs, dtcs};
pub use modules::modules;
pub use read::read;
pub use unlock::unlock;
