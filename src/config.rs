use std::{env, time::Duration};

use actix_web::cookie::Key;

use crate::{bootstrap::GuardTimers, errors::AppError};

/// `Key::from` panics below this length.
const MIN_SESSION_KEY_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub port: u16,
    pub session_key: Vec<u8>,
    pub cookie_secure: bool,
    pub timers: GuardTimers,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let session_key = env::var("SESSION_KEY").map_err(|e| {
            log::error!("FATAL: SESSION_KEY environment variable not set");
            AppError::EnvVarError(e)
        })?;

        Self::build(
            env::var("DATABASE_URL").ok(),
            env::var("BIND_ADDR").ok(),
            env::var("PORT").ok(),
            session_key,
            env::var("COOKIE_SECURE").ok(),
            env::var("TENANT_REFRESH_WAIT_MS").ok(),
            env::var("LOADING_CEILING_MS").ok(),
        )
    }

    fn build(
        database_url: Option<String>,
        bind_addr: Option<String>,
        port: Option<String>,
        session_key: String,
        cookie_secure: Option<String>,
        refresh_wait_ms: Option<String>,
        loading_ceiling_ms: Option<String>,
    ) -> Result<Self, AppError> {
        if session_key.len() < MIN_SESSION_KEY_LEN {
            return Err(AppError::ConfigError(format!(
                "SESSION_KEY must be at least {} bytes",
                MIN_SESSION_KEY_LEN
            )));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|e| AppError::ConfigError(format!("PORT: {}", e)))?,
            None => 8080,
        };

        let cookie_secure = match cookie_secure.as_deref() {
            None => false,
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            Some(other) => {
                return Err(AppError::ConfigError(format!(
                    "COOKIE_SECURE: expected true/false, got {}",
                    other
                )))
            }
        };

        let timers = GuardTimers {
            tenant_refresh_wait: parse_millis("TENANT_REFRESH_WAIT_MS", refresh_wait_ms, 2_000)?,
            loading_ceiling: parse_millis("LOADING_CEILING_MS", loading_ceiling_ms, 10_000)?,
        };
        if timers.tenant_refresh_wait >= timers.loading_ceiling {
            return Err(AppError::ConfigError(format!(
                "TENANT_REFRESH_WAIT_MS ({:?}) must be shorter than LOADING_CEILING_MS ({:?})",
                timers.tenant_refresh_wait, timers.loading_ceiling
            )));
        }

        Ok(Config {
            database_url: database_url.unwrap_or_else(|| "sqlite://rota_str.db".to_owned()),
            bind_addr: bind_addr.unwrap_or_else(|| "0.0.0.0".to_owned()),
            port,
            session_key: session_key.into_bytes(),
            cookie_secure,
            timers,
        })
    }

    pub fn session_key(&self) -> Key {
        Key::from(&self.session_key)
    }
}

fn parse_millis(name: &str, value: Option<String>, default: u64) -> Result<Duration, AppError> {
    match value {
        Some(v) => v
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| AppError::ConfigError(format!("{}: {}", name, e))),
        None => Ok(Duration::from_millis(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> String {
        "k".repeat(64)
    }

    #[test]
    fn defaults_apply() {
        let cfg = Config::build(None, None, None, key(), None, None, None).unwrap();
        assert_eq!(cfg.database_url, "sqlite://rota_str.db");
        assert_eq!(cfg.port, 8080);
        assert!(!cfg.cookie_secure);
        assert_eq!(cfg.timers.tenant_refresh_wait, Duration::from_secs(2));
        assert_eq!(cfg.timers.loading_ceiling, Duration::from_secs(10));
    }

    #[test]
    fn short_session_key_is_rejected() {
        let err = Config::build(None, None, None, "short".into(), None, None, None).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = Config::build(
            Some("sqlite::memory:".into()),
            Some("127.0.0.1".into()),
            Some("9000".into()),
            key(),
            Some("true".into()),
            Some("500".into()),
            Some("3000".into()),
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert!(cfg.cookie_secure);
        assert_eq!(cfg.timers.tenant_refresh_wait, Duration::from_millis(500));
        assert_eq!(cfg.timers.loading_ceiling, Duration::from_millis(3000));
    }

    #[test]
    fn refresh_wait_must_fit_inside_the_loading_ceiling() {
        for (wait, ceiling) in [("3000", "3000"), ("5000", "3000")] {
            let err = Config::build(
                None,
                None,
                None,
                key(),
                None,
                Some(wait.into()),
                Some(ceiling.into()),
            )
            .unwrap_err();
            assert!(matches!(err, AppError::ConfigError(_)));
        }
        let err = Config::build(None, None, None, key(), None, Some("20000".into()), None).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn bad_port_is_rejected() {
        assert!(Config::build(None, None, Some("http".into()), key(), None, None, None).is_err());
    }
}
