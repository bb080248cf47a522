use super::*;
use chrono::Duration;

#[tokio::test]
async fn test_load_missing_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let loaded = LocalCredentials::load(&dir.path().join("credentials.json"))
        .await
        .unwrap();
    assert!(loaded.is_none());
}

#[tokio::test]
async fn test_load_or_create_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.json");

    let first = LocalCredentials::load_or_create(&path).await.unwrap();
    let second = LocalCredentials::load_or_create(&path).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(BASE64.decode(&first.secret).unwrap().len(), 32);
    assert_eq!(first.workstation_id(), second.workstation_id());
}

#[cfg(unix)]
#[tokio::test]
async fn test_created_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.json");
    LocalCredentials::load_or_create(&path).await.unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn test_reads_camel_case_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.json");
    std::fs::write(
        &path,
        r#"{"secret":"c2VjcmV0","bearerToken":"tok","bearerExpiresAt":"2030-01-01T00:00:00Z"}"#,
    )
    .unwrap();

    let credentials = LocalCredentials::load(&path).await.unwrap().unwrap();
    assert_eq!(credentials.bearer_token.as_deref(), Some("tok"));
    assert!(credentials.bearer_expires_at.is_some());
}

#[tokio::test]
async fn test_corrupt_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.json");
    std::fs::write(&path, "nope").unwrap();

    assert!(matches!(
        LocalCredentials::load(&path).await,
        Err(CredentialsError::Corrupt(_))
    ));
}

#[test]
fn test_bearer_token_validity() {
    let now = Utc::now();
    let mut credentials = LocalCredentials::generate();
    assert!(!credentials.bearer_token_valid(now));

    credentials.bearer_token = Some("   ".to_string());
    assert!(!credentials.bearer_token_valid(now));

    credentials.bearer_token = Some("tok".to_string());
    assert!(credentials.bearer_token_valid(now));

    credentials.bearer_expires_at = Some(now + Duration::hours(1));
    assert_eq!(credentials.valid_bearer_token(now), Some("tok"));

    credentials.bearer_expires_at = Some(now - Duration::seconds(1));
    assert!(!credentials.bearer_token_valid(now));
}

#[test]
fn test_workstation_id_shape() {
    let credentials = LocalCredentials {
        secret: "abc".to_string(),
        bearer_token: None,
        bearer_expires_at: None,
    };
    let id = credentials.workstation_id();
    assert_eq!(id.len(), 16);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    // sha256("abc") starts with ba7816bf8f01cfea
    assert_eq!(id, "ba7816bf8f01cfea");
}

#[test]
fn test_debug_redacts() {
    let mut credentials = LocalCredentials::generate();
    credentials.bearer_token = Some("very-secret".to_string());
    let debug = format!("{:?}", credentials);
    assert!(!debug.contains("very-secret"));
    assert!(!debug.contains(&credentials.secret));
}
