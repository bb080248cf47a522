//! `palmlink status`

use crate::server::config::AppConfig;
use anyhow::Result;
use chrono::Utc;
use palmlink_core::{ClientRegistry, InstanceLock, LocalCredentials, SessionDescriptor};
use std::path::Path;
use std::time::Duration;

/// Print daemon, device, session and tunnel status.
pub async fn run(config: &AppConfig) -> Result<()> {
    let settings = config.daemon_settings()?;
    let now = Utc::now();

    println!("\npalmlink status\n{}", "-".repeat(40));
    println!("  Data directory:  {}", settings.data_dir.display());

    let stale_after = Duration::from_secs(config.lock.stale_after_secs);
    match InstanceLock::read(&settings.lock_path()).await {
        Ok(Some(lock)) if !lock.is_stale(stale_after, now) => {
            let since = (now - lock.started_at).num_seconds().max(0);
            println!("  Daemon:          running (pid {}, up {}s)", lock.pid, since);
        }
        Ok(Some(lock)) => println!("  Daemon:          not running (stale lock from pid {})", lock.pid),
        Ok(None) => println!("  Daemon:          not running"),
        Err(e) => println!("  Daemon:          unknown ({})", e),
    }

    match ClientRegistry::open(settings.registry_path()).await {
        Ok(registry) => println!("  Paired devices:  {}", registry.list().await.len()),
        Err(e) => println!("  Paired devices:  unreadable ({})", e),
    }

    let sessions = read_sessions(&settings.sessions_dir).await;
    println!("  Active sessions: {}", sessions.len());
    for session in &sessions {
        println!(
            "    {} [{}] {}",
            session.session_id,
            session.provider,
            session.cwd.display()
        );
    }

    if config.tunnel.enabled {
        let url = settings.tunnel.public_url().unwrap_or_else(|| "-".to_string());
        println!("  Tunnel:          enabled ({})", url);
        let token = match LocalCredentials::load(&settings.credentials_path()).await {
            Ok(Some(credentials)) if credentials.bearer_token_valid(now) => "valid",
            Ok(Some(_)) => "missing or expired",
            Ok(None) => "no credentials",
            Err(_) => "unreadable credentials",
        };
        println!("  Tunnel token:    {}", token);
    } else {
        println!("  Tunnel:          disabled");
    }
    println!();

    Ok(())
}

async fn read_sessions(dir: &Path) -> Vec<SessionDescriptor> {
    let mut sessions = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return sessions;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if let Ok(descriptor) = serde_json::from_slice::<SessionDescriptor>(&bytes) {
                sessions.push(descriptor);
            }
        }
    }
    sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    sessions
}
