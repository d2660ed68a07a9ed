use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, bail};
use tracing::warn;

const PLACEHOLDER_SECRETS: &[&str] = &[
    "dev-secret-change-me",
    "change-me",
    "changeme",
    "secret",
    "your-secret-here",
];

const DEV_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub ws_port: u16,
    pub public_dir: PathBuf,
    pub session_days: i64,
    pub production: bool,
    pub admin_email: Option<String>,
    pub prune_interval_secs: u64,
}

impl ServerConfig {
    /// Read `DOMU_*` variables. Call after `dotenvy::dotenv()`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let production = get("DOMU_ENV").is_some_and(|v| v.eq_ignore_ascii_case("production"));

        let jwt_secret = match get("DOMU_JWT_SECRET").filter(|s| !s.trim().is_empty()) {
            Some(secret) if production && PLACEHOLDER_SECRETS.contains(&secret.as_str()) => {
                bail!("DOMU_JWT_SECRET is still a placeholder; set a real secret for production")
            }
            Some(secret) => secret,
            None if production => bail!("DOMU_JWT_SECRET must be set in production"),
            None => {
                warn!("DOMU_JWT_SECRET unset, using the development placeholder");
                DEV_SECRET.to_string()
            }
        };

        let session_days: i64 = parse_or(&get, "DOMU_SESSION_DAYS", 7)?;
        if session_days < 1 {
            bail!("DOMU_SESSION_DAYS must be at least 1");
        }

        Ok(Self {
            jwt_secret,
            db_path: get("DOMU_DB_PATH").unwrap_or_else(|| "domu.db".into()).into(),
            host: get("DOMU_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "DOMU_PORT", 3000)?,
            ws_port: parse_or(&get, "DOMU_WS_PORT", 3001)?,
            public_dir: get("DOMU_PUBLIC_DIR").unwrap_or_else(|| "./public".into()).into(),
            session_days,
            production,
            admin_email: get("DOMU_ADMIN_EMAIL")
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty()),
            prune_interval_secs: parse_or::<u64>(&get, "DOMU_SESSION_PRUNE_SECS", 3600)?.max(1),
        })
    }

    pub fn http_addr(&self) -> anyhow::Result<SocketAddr> {
        addr(&self.host, self.port)
    }

    pub fn ws_addr(&self) -> anyhow::Result<SocketAddr> {
        addr(&self.host, self.ws_port)
    }
}

fn addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", host, port))
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<ServerConfig> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_in_development() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.jwt_secret, DEV_SECRET);
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.ws_port, 3001);
        assert_eq!(cfg.session_days, 7);
        assert_eq!(cfg.db_path, PathBuf::from("domu.db"));
        assert!(!cfg.production);
        assert!(cfg.admin_email.is_none());
        assert_eq!(cfg.http_addr().unwrap().port(), 3000);
    }

    #[test]
    fn production_refuses_placeholder_secrets() {
        assert!(load(&[("DOMU_ENV", "production")]).is_err());
        assert!(load(&[("DOMU_ENV", "production"), ("DOMU_JWT_SECRET", "change-me")]).is_err());
        let cfg = load(&[("DOMU_ENV", "Production"), ("DOMU_JWT_SECRET", "s3cr3t-long-value")]).unwrap();
        assert!(cfg.production);
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = load(&[("DOMU_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("DOMU_PORT"));
        assert!(load(&[("DOMU_SESSION_DAYS", "0")]).is_err());
    }

    #[test]
    fn admin_email_is_normalised() {
        let cfg = load(&[("DOMU_ADMIN_EMAIL", " Root@Example.com ")]).unwrap();
        assert_eq!(cfg.admin_email.as_deref(), Some("root@example.com"));
    }
}
