
    use super::*;
    use crate::server::loader::load_with_overlay;

    #[test]
    fn test_embedded_defaults_parse() {
        let config = load_with_overlay("").unwrap();
        assert_eq!(config.server.port, 7860);
        assert_eq!(config.pairing.ttl_secs, 300);
        assert_eq!(config.pairing.max_confirm_attempts, 3);
        assert_eq!(config.delivery.max_pending, 256);
        assert!(!config.tunnel.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_daemon_settings_mapping() {
        let config = load_with_overlay(
            r#"
            data_dir = "/srv/palmlink"

            [server]
            port = 9000
            workstation_name = "buildbox"

            [tunnel]
            enabled = true
            subdomain = " alice "
            restart_base_delay_ms = 250
            max_restarts = 2
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        let settings = config.daemon_settings().unwrap();
        assert_eq!(settings.data_dir, PathBuf::from("/srv/palmlink"));
        assert_eq!(settings.sessions_dir, PathBuf::from("/srv/palmlink/sessions"));
        assert_eq!(settings.workstation_name, "buildbox");
        assert_eq!(settings.tunnel.local_port, 9000);
        assert_eq!(settings.tunnel.subdomain.as_deref(), Some("alice"));
        assert_eq!(settings.tunnel.restart.base_delay, Duration::from_millis(250));
        assert_eq!(settings.tunnel.restart.max_attempts, 2);
        assert_eq!(
            settings.tunnel.public_url().as_deref(),
            Some("https://alice.palmlink.dev")
        );
    }

    #[test]
    fn test_explicit_sessions_dir() {
        let config = load_with_overlay(
            r#"
            data_dir = "/srv/palmlink"
            sessions_dir = "/tmp/agent-sessions"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.sessions_dir().unwrap(),
            PathBuf::from("/tmp/agent-sessions")
        );
    }

    #[test]
    fn test_zero_port_rejected() {
        let config = load_with_overlay("[server]\nport = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server.port"));
    }

    #[test]
    fn test_tunnel_requires_subdomain() {
        let config = load_with_overlay("[tunnel]\nenabled = true\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("subdomain"));

        let config =
            load_with_overlay("[tunnel]\nenabled = true\nsubdomain = \"Not_Valid\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_home_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/state"), home.join("state"));
        }
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }
