//! Integration tests for palmlink
//!
//! These drive the daemon the way a connection layer would:
//! - pairing over JSON messages with a device-side SPAKE2 client
//! - authenticating with the derived token
//! - receiving encrypted, ack-gated transcript batches

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use palmlink_core::channel::ConnectionId;
use palmlink_core::delivery::TransportError;
use palmlink_core::instance_lock::{InstanceLock, LockError, DEFAULT_STALE_AFTER};
use palmlink_core::pairing::{ConfirmMessage, InitMessage, PairingMessage};
use palmlink_core::{Daemon, DaemonSettings, FrameSink};
use palmlink_crypto::{EncryptedData, PairingClient, PairingKeys, SessionCipher};
use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    fn get(&self, index: usize) -> Option<String> {
        self.frames.lock().unwrap().get(index).cloned()
    }
}

impl FrameSink for RecordingSink {
    fn send_frame(&self, _connection: &ConnectionId, frame: String) -> Result<(), TransportError> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&self, _connection: &ConnectionId) {}
}

fn settings(dir: &Path) -> DaemonSettings {
    let mut settings = DaemonSettings::under(dir);
    settings.stability_window = Duration::from_millis(50);
    settings.workstation_name = "devbox".to_string();
    settings
}

async fn pair_device(daemon: &Daemon, device_id: &str) -> PairingKeys {
    let code = daemon.start_pairing().await;
    let (client, spake) = PairingClient::start(&code.display, device_id);

    let init = PairingMessage::PairInit(InitMessage {
        spake: BASE64.encode(spake),
        device_id: Some(device_id.to_string()),
        device_name: Some("Pixel".to_string()),
    });
    let reply = daemon
        .handle_pairing(&serde_json::to_string(&init).unwrap())
        .await;
    let PairingMessage::PairChallenge(challenge) = reply else {
        panic!("expected pair_challenge, got: {:?}", reply);
    };

    let keys = client
        .finish(&BASE64.decode(&challenge.spake).unwrap())
        .unwrap();
    let confirm = PairingMessage::PairConfirm(ConfirmMessage {
        mac: BASE64.encode(keys.device_mac()),
    });
    let reply = daemon
        .handle_pairing(&serde_json::to_string(&confirm).unwrap())
        .await;
    let PairingMessage::PairComplete(complete) = reply else {
        panic!("expected pair_complete, got: {:?}", reply);
    };

    assert_eq!(complete.workstation_name, "devbox");
    assert_eq!(complete.workstation_id, daemon.credentials().workstation_id());
    keys.verify_workstation_mac(&BASE64.decode(&complete.mac).unwrap())
        .unwrap();
    keys
}

fn open(key: [u8; 32], frame: &str) -> Value {
    let envelope = EncryptedData::from_base64(frame).unwrap();
    let plaintext = SessionCipher::from_key(key).decrypt(&envelope).unwrap();
    serde_json::from_slice(&plaintext).unwrap()
}

async fn wait_for_frame(sink: &RecordingSink, index: usize) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(frame) = sink.get(index) {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("frame not delivered in time")
}

// ============================================================================
// Pairing and authentication
// ============================================================================

#[tokio::test]
async fn test_paired_device_authenticates() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::new(settings(dir.path()), Arc::new(RecordingSink::default()))
        .await
        .unwrap();
    let mut completions = daemon.take_pairing_completions().await.unwrap();

    let keys = pair_device(&daemon, "phone-1").await;

    let paired = completions.recv().await.unwrap();
    assert_eq!(paired.device_id, "phone-1");
    assert_eq!(paired.device_name, "Pixel");

    let conn = ConnectionId::from("ws-1");
    assert!(!daemon.authenticate(&conn, "phone-1", "guess").await);
    assert!(daemon.authenticate(&conn, "phone-1", &keys.auth_token()).await);
}

#[tokio::test]
async fn test_pairing_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (token, workstation_id) = {
        let daemon = Daemon::new(settings(dir.path()), Arc::new(RecordingSink::default()))
            .await
            .unwrap();
        let keys = pair_device(&daemon, "phone-1").await;
        (keys.auth_token(), daemon.credentials().workstation_id())
    };

    let daemon = Daemon::new(settings(dir.path()), Arc::new(RecordingSink::default()))
        .await
        .unwrap();
    assert_eq!(daemon.credentials().workstation_id(), workstation_id);
    assert!(
        daemon
            .authenticate(&ConnectionId::from("c1"), "phone-1", &token)
            .await
    );

    let raw = std::fs::read_to_string(dir.path().join("clients.json")).unwrap();
    assert!(!raw.contains(&token));
}

// ============================================================================
// Live transcript streaming
// ============================================================================

#[tokio::test]
async fn test_session_transcript_streams_in_acked_batches() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let daemon = Arc::new(
        Daemon::new(settings(dir.path()), sink.clone())
            .await
            .unwrap(),
    );
    let keys = pair_device(&daemon, "phone-1").await;
    let key = keys.encryption_key();
    let conn = ConnectionId::from("c1");
    assert!(daemon.authenticate(&conn, "phone-1", &keys.auth_token()).await);

    let sessions_dir = daemon.settings().sessions_dir.clone();
    std::fs::create_dir_all(&sessions_dir).unwrap();
    let transcript = dir.path().join("s1.jsonl");
    std::fs::write(
        &transcript,
        "{\"type\":\"user\",\"timestamp\":\"T1\",\"message\":\"hello\"}\n",
    )
    .unwrap();
    std::fs::write(
        sessions_dir.join("s1.json"),
        serde_json::to_vec(&json!({
            "sessionId": "s1",
            "provider": "claude",
            "cwd": dir.path(),
            "transcriptPath": transcript,
        }))
        .unwrap(),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let runner = {
        let daemon = daemon.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { daemon.run(cancel).await })
    };

    let first = open(key, &wait_for_frame(&sink, 0).await);
    assert_eq!(first["sessionId"], "s1");
    assert_eq!(first["initial"], true);
    assert_eq!(first["lines"].as_array().unwrap().len(), 1);

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&transcript)
        .unwrap();
    file.write_all(b"{\"type\":\"assistant\",\"timestamp\":\"T2\",\"message\":\"hi\"}\n")
        .unwrap();
    file.sync_all().unwrap();

    // Nothing more goes out until the first batch is acknowledged.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(sink.count(), 1);

    assert!(daemon.acknowledge(&conn));
    let second = open(key, &wait_for_frame(&sink, 1).await);
    assert_eq!(second["initial"], false);
    assert_eq!(second["lines"][0]["timestamp"], "T2");
    assert_eq!(second["lines"][0]["kind"], "assistant");

    // A reconnecting client catches up from its cursor.
    let lines = daemon.transcripts().since_timestamp("s1", "T1").await;
    assert_eq!(lines.len(), 1);

    cancel.cancel();
    runner.await.unwrap().unwrap();
}

// ============================================================================
// Single instance
// ============================================================================

#[tokio::test]
async fn test_second_daemon_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = settings(dir.path()).lock_path();

    let _held = InstanceLock::acquire(&path, DEFAULT_STALE_AFTER).await.unwrap();
    let err = InstanceLock::acquire(&path, DEFAULT_STALE_AFTER)
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::AlreadyRunning { .. }));
    assert!(err.to_string().contains(&std::process::id().to_string()));
}
