//! Full session lifecycle over loopback: role resolution, admission
//! gating, message exchange, teardown and cooldown carry-over.

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::time::timeout;

use linkchat_core::{AdmissionController, DeviceTimingProfile, LinkKind};
use linkchat_daemon::events::{GroupInfo, PeerInfo};
use linkchat_daemon::session::{SessionManager, SessionState};
use linkchat_daemon::ui::{Direction, UiSink};
use tempdir::TempDir;

#[derive(Default)]
struct RecordingUi {
    statuses: Mutex<Vec<String>>,
    messages: Mutex<Vec<(Direction, String)>>,
}

impl RecordingUi {
    fn has_status(&self, needle: &str) -> bool {
        self.statuses.lock().unwrap().iter().any(|s| s.contains(needle))
    }

    fn has_message(&self, direction: Direction, text: &str) -> bool {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .any(|(d, t)| *d == direction && t == text)
    }
}

impl UiSink for RecordingUi {
    fn status(&self, text: &str) {
        self.statuses.lock().unwrap().push(text.to_string());
    }

    fn message(&self, direction: Direction, text: &str, _at: SystemTime) {
        self.messages.lock().unwrap().push((direction, text.to_string()));
    }

    fn peers(&self, _peers: &[PeerInfo]) {}
}

fn test_profile() -> DeviceTimingProfile {
    DeviceTimingProfile {
        socket_timeout_ms: 2_000,
        init_delay_ms: 0,
        pre_connect_delay_ms: 0,
        max_retries: 1,
        backoff_base_ms: 10,
        backoff_multiplier: 1.5,
        max_backoff_ms: 50,
        strict_init_validation: false,
    }
}

fn admission(dir: &TempDir, name: &str) -> Arc<AdmissionController> {
    let ctl = Arc::new(AdmissionController::new(
        name,
        dir.path(),
        Duration::from_secs(60),
        &test_profile(),
    ));
    ctl.initialize().unwrap();
    ctl
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_state(manager: &SessionManager, target: SessionState) {
    let mut rx = manager.subscribe_state();
    timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target:?}"))
        .unwrap();
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn host_and_client_exchange_messages() {
    let host_dir = TempDir::new("linkchat-host").unwrap();
    let client_dir = TempDir::new("linkchat-client").unwrap();
    let host_admission = admission(&host_dir, "host");
    let client_admission = admission(&client_dir, "client");
    let host_ui = Arc::new(RecordingUi::default());
    let client_ui = Arc::new(RecordingUi::default());
    let port = free_port();

    let host = SessionManager::new(
        port,
        "127.0.0.".to_string(),
        test_profile(),
        host_admission.clone(),
        host_ui.clone(),
    );
    let client = SessionManager::new(
        port,
        "127.0.0.".to_string(),
        test_profile(),
        client_admission.clone(),
        client_ui.clone(),
    );

    host.clone()
        .on_group_formed(GroupInfo {
            group_formed: true,
            is_group_owner: true,
            owner_address: Some("127.0.0.1".parse().unwrap()),
        })
        .await;
    wait_until(|| host_ui.has_status("listening"), "host listener").await;

    client
        .clone()
        .on_group_formed(GroupInfo {
            group_formed: true,
            is_group_owner: false,
            owner_address: Some("127.0.0.1".parse().unwrap()),
        })
        .await;

    wait_for_state(&host, SessionState::Active).await;
    wait_for_state(&client, SessionState::Active).await;
    assert_eq!(host_admission.active_count(), 1);
    assert_eq!(client_admission.active_count(), 1);

    host.send("hi").await.unwrap();
    client.send("hi back").await.unwrap();
    wait_until(|| client_ui.has_message(Direction::Received, "hi"), "client delivery").await;
    wait_until(|| host_ui.has_message(Direction::Received, "hi back"), "host delivery").await;
    assert!(host_ui.has_message(Direction::Sent, "hi"));

    // Host leaves; the client sees EOF and returns to idle on its own.
    host.teardown("test over").await;
    assert_eq!(host.state(), SessionState::Idle);
    wait_for_state(&client, SessionState::Idle).await;
    assert_eq!(host_admission.active_count(), 0);
    assert_eq!(client_admission.active_count(), 0);

    // Repeated teardown is a no-op.
    client.teardown("again").await;
    assert_eq!(client.state(), SessionState::Idle);

    // The cooldown outlives the session.
    assert!(!client_admission.should_connect("127.0.0.1", LinkKind::AdHoc));
}

#[tokio::test(flavor = "multi_thread")]
async fn denied_client_never_dials() {
    let dir = TempDir::new("linkchat-denied").unwrap();
    let ctl = admission(&dir, "client");
    ctl.record_encounter("127.0.0.1", LinkKind::AdHoc);
    let ui = Arc::new(RecordingUi::default());

    let client = SessionManager::new(
        free_port(),
        "127.0.0.".to_string(),
        test_profile(),
        ctl,
        ui.clone(),
    );
    client
        .clone()
        .on_group_formed(GroupInfo {
            group_formed: true,
            is_group_owner: false,
            owner_address: Some("127.0.0.1".parse().unwrap()),
        })
        .await;

    wait_until(|| ui.has_status("connection suppressed"), "suppression notice").await;
    wait_for_state(&client, SessionState::Idle).await;
    // Denied means no dial at all, so no retry ever starts.
    assert!(!ui.has_status("retrying"));
}

#[tokio::test(flavor = "multi_thread")]
async fn rapid_group_events_settle_to_idle() {
    let dir = TempDir::new("linkchat-rapid").unwrap();
    let ctl = admission(&dir, "client");
    ctl.record_encounter("127.0.0.1", LinkKind::AdHoc);
    let ui = Arc::new(RecordingUi::default());

    let client = SessionManager::new(
        free_port(),
        "127.0.0.".to_string(),
        test_profile(),
        ctl,
        ui.clone(),
    );
    // Each event supersedes the one before it, and every denied worker fails
    // immediately; the fast worker must not race the published state.
    for _ in 0..10 {
        client
            .clone()
            .on_group_formed(GroupInfo {
                group_formed: true,
                is_group_owner: false,
                owner_address: Some("127.0.0.1".parse().unwrap()),
            })
            .await;
    }

    wait_for_state(&client, SessionState::Idle).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state(), SessionState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_failure_retries_then_gives_up() {
    let dir = TempDir::new("linkchat-refused").unwrap();
    let ui = Arc::new(RecordingUi::default());

    // Nothing listens on the port, every attempt is refused.
    let client = SessionManager::new(
        free_port(),
        "127.0.0.".to_string(),
        test_profile(),
        admission(&dir, "client"),
        ui.clone(),
    );
    client
        .clone()
        .on_group_formed(GroupInfo {
            group_formed: true,
            is_group_owner: false,
            owner_address: Some("127.0.0.1".parse().unwrap()),
        })
        .await;

    wait_until(|| ui.has_status("connection failed after 2 attempts"), "exhaustion notice").await;
    assert!(ui.has_status("retrying in"));
    wait_for_state(&client, SessionState::Idle).await;
}
