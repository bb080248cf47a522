use super::*;
use crate::delivery::{DeliveryError, DeliveryOutcome};
use crate::error::Error;
use crate::pairing::PairingErrorCode;
use crate::transcript::{LineKind, StoredLine};
use palmlink_crypto::{EncryptedData, SessionCipher};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Mutex as StdMutex;

const KEY: [u8; 32] = [7u8; 32];

#[derive(Default)]
struct RecordingSink {
    frames: StdMutex<Vec<(ConnectionId, String)>>,
    closed: StdMutex<Vec<ConnectionId>>,
}

impl RecordingSink {
    fn frames(&self) -> Vec<(ConnectionId, String)> {
        self.frames.lock().unwrap().clone()
    }

    fn closed(&self) -> Vec<ConnectionId> {
        self.closed.lock().unwrap().clone()
    }
}

impl FrameSink for RecordingSink {
    fn send_frame(
        &self,
        connection: &ConnectionId,
        frame: String,
    ) -> std::result::Result<(), TransportError> {
        self.frames.lock().unwrap().push((connection.clone(), frame));
        Ok(())
    }

    fn close(&self, connection: &ConnectionId) {
        self.closed.lock().unwrap().push(connection.clone());
    }
}

async fn daemon(dir: &Path) -> (Daemon, Arc<RecordingSink>) {
    daemon_with_limit(dir, DEFAULT_MAX_PENDING).await
}

async fn daemon_with_limit(dir: &Path, max_pending: usize) -> (Daemon, Arc<RecordingSink>) {
    let mut settings = DaemonSettings::under(dir);
    settings.stability_window = Duration::from_millis(50);
    settings.max_pending = max_pending;
    let sink = Arc::new(RecordingSink::default());
    let daemon = Daemon::new(settings, sink.clone()).await.unwrap();
    daemon
        .registry()
        .add("phone", "secret-token", &KEY, "Pixel")
        .await
        .unwrap();
    (daemon, sink)
}

fn open(frame: &str) -> Value {
    let envelope = EncryptedData::from_base64(frame).unwrap();
    let plaintext = SessionCipher::from_key(KEY).decrypt(&envelope).unwrap();
    serde_json::from_slice(&plaintext).unwrap()
}

fn batch(session_id: &str, n: usize) -> MessageBatch {
    MessageBatch {
        session_id: session_id.to_string(),
        lines: (0..n)
            .map(|i| StoredLine {
                payload: json!({"type": "user", "n": i}),
                timestamp: Some(format!("T{}", i)),
                uuid: None,
                kind: LineKind::User,
            })
            .collect(),
        initial: false,
    }
}

#[tokio::test]
async fn test_settings_paths() {
    let settings = DaemonSettings::under("/var/palmlink");
    assert_eq!(settings.registry_path(), PathBuf::from("/var/palmlink/clients.json"));
    assert_eq!(settings.lock_path(), PathBuf::from("/var/palmlink/palmlink.lock"));
    assert_eq!(settings.sessions_dir, PathBuf::from("/var/palmlink/sessions"));
    assert_eq!(settings.tunnel.credentials_path, settings.credentials_path());
    assert!(!settings.tunnel.enabled);
}

#[tokio::test]
async fn test_new_creates_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, _) = daemon(dir.path()).await;
    assert!(dir.path().join(CREDENTIALS_FILE).exists());
    assert_eq!(daemon.credentials().workstation_id().len(), 16);
}

#[tokio::test]
async fn test_authenticate() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, _) = daemon(dir.path()).await;
    let conn = ConnectionId::from("c1");

    assert!(!daemon.authenticate(&conn, "phone", "wrong").await);
    assert!(!daemon.authenticate(&conn, "tablet", "secret-token").await);
    assert!(daemon.authenticate(&conn, "phone", "secret-token").await);
}

#[tokio::test]
async fn test_deliver_requires_authentication() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, sink) = daemon(dir.path()).await;

    let result = daemon.deliver(&ConnectionId::from("c1"), batch("s1", 1));
    assert!(matches!(
        result,
        Err(Error::Channel(ChannelError::NoContext(_)))
    ));
    assert!(sink.frames().is_empty());
}

#[tokio::test]
async fn test_delivery_is_encrypted_and_ack_gated() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, sink) = daemon(dir.path()).await;
    let conn = ConnectionId::from("c1");
    assert!(daemon.authenticate(&conn, "phone", "secret-token").await);

    let first = daemon.deliver(&conn, batch("s1", 2)).unwrap();
    daemon.deliver(&conn, batch("s2", 1)).unwrap();

    let frames = sink.frames();
    assert_eq!(frames.len(), 1);
    let opened = open(&frames[0].1);
    assert_eq!(opened["sessionId"], "s1");
    assert_eq!(opened["lines"].as_array().unwrap().len(), 2);

    assert!(daemon.acknowledge(&conn));
    assert_eq!(first.outcome().await, crate::delivery::DeliveryOutcome::Acknowledged);
    let frames = sink.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(open(&frames[1].1)["sessionId"], "s2");
}

#[tokio::test]
async fn test_disconnect_drops_context_and_queue() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, sink) = daemon(dir.path()).await;
    let conn = ConnectionId::from("c1");
    assert!(daemon.authenticate(&conn, "phone", "secret-token").await);

    let receipt = daemon.deliver(&conn, batch("s1", 1)).unwrap();
    daemon.disconnect(&conn);

    assert_eq!(receipt.outcome().await, crate::delivery::DeliveryOutcome::Dropped);
    assert!(!daemon.acknowledge(&conn));
    assert!(daemon.deliver(&conn, batch("s1", 1)).is_err());
    // Client-initiated: the connection layer already knows.
    assert!(sink.closed().is_empty());
}

#[tokio::test]
async fn test_deliver_overflow_closes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, sink) = daemon_with_limit(dir.path(), 1).await;
    let conn = ConnectionId::from("c1");
    assert!(daemon.authenticate(&conn, "phone", "secret-token").await);

    let in_flight = daemon.deliver(&conn, batch("s1", 1)).unwrap();
    daemon.deliver(&conn, batch("s2", 1)).unwrap();
    let result = daemon.deliver(&conn, batch("s3", 1));

    assert!(matches!(
        result,
        Err(Error::Delivery(DeliveryError::QueueOverflow { limit: 1, .. }))
    ));
    assert_eq!(in_flight.outcome().await, DeliveryOutcome::Dropped);
    assert_eq!(sink.closed(), vec![conn.clone()]);
    assert!(daemon.deliver(&conn, batch("s4", 1)).is_err());
    assert_eq!(sink.frames().len(), 1);
}

#[tokio::test]
async fn test_fan_out_overflow_closes_only_slow_client() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, sink) = daemon_with_limit(dir.path(), 1).await;
    let slow = ConnectionId::from("slow");
    let fast = ConnectionId::from("fast");
    assert!(daemon.authenticate(&slow, "phone", "secret-token").await);
    assert!(daemon.authenticate(&fast, "phone", "secret-token").await);

    for n in 0..3 {
        daemon.fan_out(batch(&format!("s{}", n), 1));
        assert!(daemon.acknowledge(&fast));
    }

    assert_eq!(sink.closed(), vec![slow.clone()]);
    assert_eq!(daemon.channels.connections(), vec![fast.clone()]);

    // Later batches reach only the client that kept up.
    daemon.fan_out(batch("s3", 1));
    let last = sink.frames().pop().unwrap();
    assert_eq!(last.0, fast);
    assert_eq!(open(&last.1)["sessionId"], "s3");
}

#[tokio::test]
async fn test_revoke_disconnects_device() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, sink) = daemon(dir.path()).await;
    let conn = ConnectionId::from("c1");
    assert!(daemon.authenticate(&conn, "phone", "secret-token").await);

    assert!(daemon.revoke("phone").await.unwrap());
    assert_eq!(sink.closed(), vec![conn.clone()]);
    assert!(daemon.deliver(&conn, batch("s1", 1)).is_err());
    assert!(!daemon.authenticate(&conn, "phone", "secret-token").await);
    assert!(!daemon.revoke("phone").await.unwrap());
}

#[tokio::test]
async fn test_open_frame_decrypts_inbound() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, _) = daemon(dir.path()).await;
    let conn = ConnectionId::from("c1");
    assert!(daemon.authenticate(&conn, "phone", "secret-token").await);

    let frame = SessionCipher::from_key(KEY)
        .encrypt(br#"{"ack":true}"#)
        .unwrap()
        .to_base64();
    let value: Value = daemon.open_frame(&conn, &frame).unwrap();
    assert_eq!(value, json!({"ack": true}));

    let tampered = SessionCipher::from_key([9u8; 32])
        .encrypt(b"{}")
        .unwrap()
        .to_base64();
    assert!(daemon.open_frame::<Value>(&conn, &tampered).is_err());
}

#[tokio::test]
async fn test_pairing_surface() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, _) = daemon(dir.path()).await;

    let reply = daemon
        .handle_pairing(r#"{"type":"pair_confirm","mac":"AAAA"}"#)
        .await;
    match reply {
        PairingMessage::PairError(e) => assert_eq!(e.code, PairingErrorCode::PairingDisabled),
        other => panic!("expected pair_error, got: {:?}", other),
    }

    let code = daemon.start_pairing().await;
    assert_eq!(code.code.len(), 8);
    daemon.cancel_pairing().await;

    assert!(daemon.take_pairing_completions().await.is_some());
    assert!(daemon.take_pairing_completions().await.is_none());
}

#[tokio::test]
async fn test_resync_since_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, sink) = daemon(dir.path()).await;
    let conn = ConnectionId::from("c1");
    assert!(daemon.authenticate(&conn, "phone", "secret-token").await);

    let transcript = dir.path().join("s1.jsonl");
    std::fs::write(
        &transcript,
        "{\"type\":\"user\",\"timestamp\":\"T1\",\"message\":\"a\"}\n{\"type\":\"assistant\",\"timestamp\":\"T2\",\"message\":\"b\"}\n",
    )
    .unwrap();
    daemon.transcripts.register("s1", &transcript).await;

    assert!(daemon.resync(&conn, "s1", "T2").await.unwrap().is_none());
    assert!(daemon.resync(&conn, "s1", "T1").await.unwrap().is_some());

    let frames = sink.frames();
    assert_eq!(frames.len(), 1);
    let opened = open(&frames[0].1);
    assert_eq!(opened["lines"].as_array().unwrap().len(), 1);
    assert_eq!(opened["initial"], false);
}

#[tokio::test]
async fn test_run_streams_new_session_to_clients() {
    let dir = tempfile::tempdir().unwrap();
    let (daemon, sink) = daemon(dir.path()).await;
    let daemon = Arc::new(daemon);
    let conn = ConnectionId::from("c1");
    assert!(daemon.authenticate(&conn, "phone", "secret-token").await);

    let cancel = CancellationToken::new();
    let runner = {
        let daemon = daemon.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { daemon.run(cancel).await })
    };

    let transcript = dir.path().join("s1.jsonl");
    std::fs::write(
        &transcript,
        "{\"type\":\"user\",\"timestamp\":\"T1\",\"message\":\"hi\"}\n",
    )
    .unwrap();

    // The session directory exists once the first scan has run.
    let sessions_dir = daemon.settings().sessions_dir.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !sessions_dir.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
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

    let frame = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some((_, frame)) = sink.frames().into_iter().next() {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let opened = open(&frame);
    assert_eq!(opened["sessionId"], "s1");
    assert_eq!(opened["initial"], true);
    assert_eq!(opened["lines"][0]["timestamp"], "T1");
    assert_eq!(daemon.active_sessions().await.len(), 1);

    cancel.cancel();
    runner.await.unwrap().unwrap();
}
