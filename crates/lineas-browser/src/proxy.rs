//! Residential proxy session rotation.
//!
//! The proxy provider hands out a new exit IP per distinct session id carried
//! in the username (`<base>_session-<id>`, underscore separated). Every browser
//! session asks for a fresh id.

use lineas_core::ProxyConfig;
use std::sync::atomic::{AtomicU64, Ordering};

/// Credentials for one proxy session.
#[derive(Debug, Clone)]
pub struct ProxySession {
    pub session_id: String,
    pub username: String,
    pub password: String,
}

/// Hands out unique proxy session ids.
#[derive(Debug)]
pub struct ProxySessions {
    config: ProxyConfig,
    counter: AtomicU64,
}

impl ProxySessions {
    #[must_use]
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            counter: AtomicU64::new(0),
        }
    }

    /// Whether a proxy should be used at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.is_configured()
    }

    /// `http://host:port`, as passed to `--proxy-server`.
    #[must_use]
    pub fn server(&self) -> String {
        self.config.server()
    }

    /// Allocate credentials for a new exit IP.
    pub fn next_session(&self) -> ProxySession {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let session_id = format!("s{n}r{}", &nonce[..10]);

        ProxySession {
            username: format!("{}_session-{}", self.config.username, session_id),
            password: self.config.password.clone().unwrap_or_default(),
            session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> ProxyConfig {
        ProxyConfig {
            host: "proxy.example.net".to_string(),
            port: 3120,
            username: "user_area-PE".to_string(),
            password: Some("pw".to_string()),
        }
    }

    #[test]
    fn test_session_username_format() {
        let sessions = ProxySessions::new(configured());
        let session = sessions.next_session();

        assert!(session
            .username
            .starts_with("user_area-PE_session-s1r"));
        assert_eq!(session.password, "pw");
        assert_eq!(sessions.server(), "http://proxy.example.net:3120");
    }

    #[test]
    fn test_sessions_are_unique() {
        let sessions = ProxySessions::new(configured());
        let a = sessions.next_session();
        let b = sessions.next_session();
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn test_unconfigured_proxy_is_disabled() {
        let sessions = ProxySessions::new(ProxyConfig::default());
        assert!(!sessions.is_enabled());
    }
}
