//! ELM327 transport against a fake adapter

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::{spawn_elm, Reply};
use opendiag_core::config::Elm327Config;
use opendiag_core::transport::elm327::Elm327Transport;
use opendiag_core::transport::{Transport, TransportError, TransportState};
use opendiag_core::uds::{RequestPolicy, UdsClient};

const VIN_ANSWER: &str =
    "014\r0: 62 F1 90 31 48 47\r1: 43 4D 38 32 36 33 33\r2: 41 31 32 33 34 35 36";

fn config() -> Elm327Config {
    Elm327Config {
        init_timeout_ms: 200,
        ..Elm327Config::default()
    }
}

async fn attached<F>(respond: F) -> (Arc<Elm327Transport>, Arc<parking_lot::Mutex<Vec<String>>>, tokio::task::JoinHandle<()>)
where
    F: Fn(&str, &str) -> Reply + Send + 'static,
{
    let (host, adapter) = tokio::io::duplex(4096);
    let (log, handle) = spawn_elm(adapter, respond);
    let transport = Arc::new(Elm327Transport::new(config()));
    transport.attach(host).await.unwrap();
    (transport, log, handle)
}

#[tokio::test(start_paused = true)]
async fn test_init_tolerates_silent_reset() {
    let (transport, log, _adapter) = attached(|_, cmd| {
        if cmd == "ATZ" {
            Reply::Silent
        } else {
            Reply::Default
        }
    })
    .await;

    assert_eq!(transport.state(), TransportState::Connected);
    assert_eq!(
        *log.lock(),
        vec!["ATZ", "ATE0", "ATL0", "ATS0", "ATH0", "ATSP0"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_init_tolerates_rejected_command() {
    let (transport, _log, _adapter) = attached(|_, cmd| {
        if cmd == "ATL0" {
            Reply::Text("?".to_string())
        } else {
            Reply::Default
        }
    })
    .await;
    assert!(transport.is_connected());
}

#[tokio::test]
async fn test_multi_line_answer_reassembled() {
    let (transport, log, _adapter) = attached(|header, cmd| match (header, cmd) {
        ("7E0", "22F190") => Reply::Text(VIN_ANSWER.to_string()),
        _ => Reply::Default,
    })
    .await;
    let client = UdsClient::new(transport.clone(), RequestPolicy::default());

    let vin = client.read_did(0x7E0, 0xF190).await.unwrap();
    assert_eq!(vin, b"1HGCM82633A123456".to_vec());

    // Header stays selected for the same module
    client.read_did(0x7E0, 0xF190).await.unwrap();
    let log = log.lock();
    assert_eq!(log.iter().filter(|c| c.as_str() == "ATSH7E0").count(), 1);
    assert!(log.contains(&"ATCRA7E8".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_pending_answer_polled_until_final() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (transport, log, _adapter) = attached({
        let calls = calls.clone();
        move |_, cmd| {
            if cmd != "3101FF00" {
                return Reply::Default;
            }
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Reply::Text("7F 31 78".to_string())
            } else {
                Reply::Text("71 01 FF 00 00".to_string())
            }
        }
    })
    .await;
    let client = UdsClient::new(transport.clone(), RequestPolicy::default());

    let status = client.routine_control(0x7E0, 0x01, 0xFF00, &[]).await.unwrap();
    assert_eq!(status, vec![0x01, 0xFF, 0x00, 0x00]);
    assert_eq!(
        log.lock().iter().filter(|c| c.as_str() == "3101FF00").count(),
        2
    );
}

#[tokio::test]
async fn test_silence_is_empty_answer() {
    let (transport, _log, _adapter) = attached(|_, _| Reply::Default).await;
    let answer = transport
        .send_uds(0x7E5, &[0x3E, 0x00], Duration::from_millis(500))
        .await
        .unwrap();
    assert!(answer.is_empty());
}

#[tokio::test]
async fn test_text_commands_and_voltage() {
    let (transport, _log, _adapter) = attached(|_, cmd| match cmd {
        "ATRV" => Reply::Text("12.4V".to_string()),
        _ => Reply::Default,
    })
    .await;
    assert_eq!(transport.identify().await.unwrap(), "ELM327 v1.5");
    assert_eq!(transport.battery_voltage().await.unwrap(), 12.4);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (transport, _log, _adapter) = attached(|_, _| Reply::Default).await;
    transport.disconnect().await.unwrap();
    transport.disconnect().await.unwrap();
    assert_eq!(transport.state(), TransportState::Disconnected);

    let err = transport
        .send_uds(0x7E0, &[0x3E, 0x00], Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NotConnected));
}

#[tokio::test]
async fn test_adapter_loss_fails_link() {
    let (transport, _log, adapter) = attached(|_, _| Reply::Default).await;
    let mut states = transport.subscribe_state();
    adapter.abort();
    let _ = adapter.await;

    let err = transport
        .send_uds(0x7E0, &[0x3E, 0x00], Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_connection());
    assert_eq!(transport.state(), TransportState::Disconnected);
    assert_eq!(states.recv().await.unwrap(), TransportState::Error);
    assert_eq!(states.recv().await.unwrap(), TransportState::Disconnected);
}
