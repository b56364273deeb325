use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::warn;

/// Used when `RUST_LOG` is unset. Targets are the workspace's crate names.
pub const DEFAULT_LOG_FILTER: &str =
    "ems_hub=debug,ems_server=debug,ems_gateway=debug,ems_api=debug,ems_db=info,tower_http=debug";

const DEV_SECRET: &str = "dev-secret-change-me";

/// Runtime configuration, read from the environment (after `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub token_ttl_days: i64,
    pub allow_role_signup: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = lookup("EMS_JWT_SECRET").unwrap_or_else(|| {
            warn!("EMS_JWT_SECRET not set, using the development secret");
            DEV_SECRET.into()
        });

        let port: u16 = match lookup("EMS_PORT") {
            Some(raw) => raw.parse().with_context(|| format!("EMS_PORT is not a port: {}", raw))?,
            None => 3000,
        };

        let token_ttl_days: i64 = match lookup("EMS_TOKEN_TTL_DAYS") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("EMS_TOKEN_TTL_DAYS is not a number: {}", raw))?,
            None => 30,
        };
        if token_ttl_days <= 0 {
            bail!("EMS_TOKEN_TTL_DAYS must be positive, got {}", token_ttl_days);
        }

        let allow_role_signup = match lookup("EMS_ALLOW_ROLE_SIGNUP").as_deref() {
            None => false,
            Some("true" | "1") => true,
            Some("false" | "0") => false,
            Some(other) => bail!("EMS_ALLOW_ROLE_SIGNUP must be true or false, got {}", other),
        };

        Ok(Self {
            jwt_secret,
            db_path: PathBuf::from(lookup("EMS_DB_PATH").unwrap_or_else(|| "ems.db".into())),
            host: lookup("EMS_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            token_ttl_days,
            allow_role_signup,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}
