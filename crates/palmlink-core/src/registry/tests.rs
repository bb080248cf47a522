use super::*;
use proptest::prelude::*;

async fn registry() -> (tempfile::TempDir, ClientRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let registry = ClientRegistry::open(dir.path().join("clients.json"))
        .await
        .unwrap();
    (dir, registry)
}

#[tokio::test]
async fn test_add_and_validate() {
    let (_dir, registry) = registry().await;
    registry
        .add("phone", "token-abc", &[7u8; 32], "Pixel")
        .await
        .unwrap();

    assert!(registry.validate("phone", "token-abc").await);
    assert!(!registry.validate("phone", "token-abd").await);
    assert!(!registry.validate("phone", "token").await);
    assert!(!registry.validate("tablet", "token-abc").await);
}

#[tokio::test]
async fn test_raw_token_never_persisted() {
    let (dir, registry) = registry().await;
    registry
        .add("phone", "super-secret-token", &[7u8; 32], "Pixel")
        .await
        .unwrap();

    let contents = std::fs::read_to_string(dir.path().join("clients.json")).unwrap();
    assert!(!contents.contains("super-secret-token"));
    assert!(contents.contains(&hash_token("super-secret-token")));
}

#[tokio::test]
async fn test_reopen_restores_records() {
    let (dir, registry) = registry().await;
    registry
        .add("phone", "token-abc", &[9u8; 32], "Pixel")
        .await
        .unwrap();
    drop(registry);

    let reopened = ClientRegistry::open(dir.path().join("clients.json"))
        .await
        .unwrap();
    assert!(reopened.validate("phone", "token-abc").await);
    assert_eq!(reopened.encryption_key("phone").await, Some([9u8; 32]));
}

#[tokio::test]
async fn test_add_overwrites_existing_device() {
    let (_dir, registry) = registry().await;
    registry.add("phone", "old", &[1u8; 32], "Old").await.unwrap();
    registry.add("phone", "new", &[2u8; 32], "New").await.unwrap();

    assert!(!registry.validate("phone", "old").await);
    assert!(registry.validate("phone", "new").await);
    assert_eq!(registry.list().await.len(), 1);
    assert_eq!(registry.get("phone").await.unwrap().name, "New");
}

#[tokio::test]
async fn test_revoke() {
    let (_dir, registry) = registry().await;
    registry.add("phone", "t", &[1u8; 32], "Pixel").await.unwrap();

    assert!(registry.revoke("phone").await.unwrap());
    assert!(!registry.revoke("phone").await.unwrap());
    assert!(!registry.validate("phone", "t").await);
    assert!(registry.get("phone").await.is_none());
}

#[tokio::test]
async fn test_rename_and_touch() {
    let (_dir, registry) = registry().await;
    let added = registry.add("phone", "t", &[1u8; 32], "Pixel").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert!(registry.touch("phone").await.unwrap());
    assert!(registry.rename("phone", "Work phone").await.unwrap());
    assert!(!registry.rename("tablet", "x").await.unwrap());
    assert!(!registry.touch("tablet").await.unwrap());

    let record = registry.get("phone").await.unwrap();
    assert_eq!(record.name, "Work phone");
    assert!(record.last_seen > added.last_seen);
    assert_eq!(record.created_at, added.created_at);
}

#[tokio::test]
async fn test_list_sorted_by_pairing_time() {
    let (_dir, registry) = registry().await;
    registry.add("b", "t", &[1u8; 32], "B").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    registry.add("a", "t", &[1u8; 32], "A").await.unwrap();

    let ids: Vec<_> = registry
        .list()
        .await
        .into_iter()
        .map(|r| r.device_id)
        .collect();
    assert_eq!(ids, vec!["b", "a"]);
}

#[tokio::test]
async fn test_corrupt_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clients.json");
    std::fs::write(&path, "{ not json").unwrap();

    let result = ClientRegistry::open(&path).await;
    assert!(matches!(result, Err(RegistryError::Corrupt(_))));
}

#[test]
fn test_unknown_device_hash_has_digest_length() {
    assert_eq!(
        UNKNOWN_DEVICE_HASH.len(),
        palmlink_crypto::token::TOKEN_HASH_HEX_LEN
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Same-length wrong tokens, other-length tokens and unknown devices
    // all take the hash + compare path and all come back false.
    #[test]
    fn prop_validate_rejects_everything_but_the_token(
        same_len in "[A-Za-z0-9_-]{43}",
        other_len in "[A-Za-z0-9_-]{0,80}",
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (_dir, registry) = registry().await;
            let token = "Q2hlY2tpbmdUb2tlbkZvclRoZVJlZ2lzdHJ5VGVzdHM";
            registry.add("phone", token, &[3u8; 32], "Pixel").await.unwrap();

            prop_assume!(same_len != token && other_len != token);
            prop_assert!(!registry.validate("phone", &same_len).await);
            prop_assert!(!registry.validate("phone", &other_len).await);
            prop_assert!(!registry.validate("unknown", token).await);
            prop_assert!(registry.validate("phone", token).await);
            Ok(())
        })?;
    }
}
