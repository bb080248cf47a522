use super::*;

fn write_state(path: &Path, pid: u32, heartbeat_at: DateTime<Utc>) {
    let state = InstanceLockState {
        pid,
        started_at: heartbeat_at,
        heartbeat_at,
    };
    std::fs::write(path, serde_json::to_vec(&state).unwrap()).unwrap();
}

#[tokio::test]
async fn test_second_acquire_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("palmlink.lock");

    let lock = InstanceLock::acquire(&path, DEFAULT_STALE_AFTER)
        .await
        .unwrap();
    assert_eq!(lock.state().pid, std::process::id());

    match InstanceLock::acquire(&path, DEFAULT_STALE_AFTER).await {
        Err(LockError::AlreadyRunning { pid }) => assert_eq!(pid, std::process::id()),
        other => panic!("expected AlreadyRunning, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_stale_heartbeat_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("palmlink.lock");
    write_state(
        &path,
        std::process::id(),
        Utc::now() - chrono::Duration::minutes(5),
    );

    let lock = InstanceLock::acquire(&path, DEFAULT_STALE_AFTER)
        .await
        .unwrap();
    let on_disk = InstanceLock::read(&path).await.unwrap().unwrap();
    assert_eq!(&on_disk, lock.state());
}

#[tokio::test]
async fn test_corrupt_lock_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("palmlink.lock");
    std::fs::write(&path, "garbage").unwrap();

    assert!(InstanceLock::acquire(&path, DEFAULT_STALE_AFTER).await.is_ok());
}

#[cfg(unix)]
#[tokio::test]
async fn test_dead_owner_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("palmlink.lock");
    // Beyond the default pid_max, so no such process.
    write_state(&path, 99_999_999, Utc::now());

    assert!(InstanceLock::acquire(&path, DEFAULT_STALE_AFTER).await.is_ok());
}

#[tokio::test]
async fn test_release_and_drop_remove_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("palmlink.lock");

    let lock = InstanceLock::acquire(&path, DEFAULT_STALE_AFTER)
        .await
        .unwrap();
    lock.release().await.unwrap();
    assert!(!path.exists());

    let lock = InstanceLock::acquire(&path, DEFAULT_STALE_AFTER)
        .await
        .unwrap();
    drop(lock);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_heartbeat_refreshes_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("palmlink.lock");
    let mut lock = InstanceLock::acquire(&path, DEFAULT_STALE_AFTER)
        .await
        .unwrap();
    let before = lock.state().heartbeat_at;

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    lock.heartbeat().await.unwrap();

    let on_disk = InstanceLock::read(&path).await.unwrap().unwrap();
    assert!(on_disk.heartbeat_at > before);
    assert_eq!(on_disk.started_at, lock.state().started_at);
}

#[tokio::test]
async fn test_heartbeat_detects_takeover() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("palmlink.lock");
    let mut lock = InstanceLock::acquire(&path, DEFAULT_STALE_AFTER)
        .await
        .unwrap();

    write_state(&path, 1, Utc::now());
    assert!(matches!(
        lock.heartbeat().await,
        Err(LockError::Lost { pid: 1 })
    ));

    // Not ours anymore, so dropping leaves it alone.
    drop(lock);
    assert!(path.exists());
}
