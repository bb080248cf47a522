use super::*;

#[test]
fn test_component_errors_convert() {
    let err: Error = RegistryError::Corrupt("bad json".to_string()).into();
    assert!(matches!(err, Error::Registry(_)));
    assert!(err.to_string().contains("bad json"));
}

#[test]
fn test_lock_error_message() {
    let err: Error = LockError::AlreadyRunning { pid: 4242 }.into();
    assert!(err.to_string().contains("4242"));
}

#[test]
fn test_io_error_converts() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: Error = io.into();
    assert!(matches!(err, Error::Io(_)));
}
