use anyhow::{anyhow, Result};
use std::{env, fmt::Display, path::PathBuf, str::FromStr};
use tracing::{info, warn};
use uuid::Uuid;

pub struct Config {
    pub port: u16,
    pub database_path: PathBuf,
    pub jwt_secret: String,
    /// Portal origins allowed by CORS. Empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_source(|key| env::var(key).ok())
    }

    pub fn from_source(source: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let home_dir = source("HOME").unwrap_or_else(|| ".".into());
        let default_db = PathBuf::from(home_dir).join(".docchat").join("docchat.db");

        let jwt_secret = source("JWT_SECRET").unwrap_or_else(|| {
            warn!("JWT_SECRET not set, generating a random one; portal tokens will not verify");
            Uuid::new_v4().to_string()
        });

        let allowed_origins = ["FRONTEND_URL", "DOCTOR_URL"]
            .into_iter()
            .filter_map(|key| source(key))
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .collect();

        Ok(Self {
            port: try_load(&source, "PORT", "4000")?,
            database_path: try_load(&source, "DATABASE_PATH", &default_db.to_string_lossy())?,
            jwt_secret,
            allowed_origins,
        })
    }
}

fn try_load<T: FromStr>(
    source: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> Result<T>
where
    T::Err: Display,
{
    let raw = source(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse()
        .map_err(|e| anyhow!("Invalid {key} value {raw:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_source(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = from_map(&[("HOME", "/home/doc")]).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(
            config.database_path,
            PathBuf::from("/home/doc/.docchat/docchat.db")
        );
        assert!(!config.jwt_secret.is_empty());
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn explicit_values_win() {
        let config = from_map(&[
            ("PORT", "8080"),
            ("DATABASE_PATH", "/tmp/chat.db"),
            ("JWT_SECRET", "s3cret"),
            ("FRONTEND_URL", "http://localhost:5173/"),
            ("DOCTOR_URL", "http://localhost:5174"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.database_path, PathBuf::from("/tmp/chat.db"));
        assert_eq!(config.jwt_secret, "s3cret");
        assert_eq!(
            config.allowed_origins,
            vec!["http://localhost:5173", "http://localhost:5174"]
        );
    }

    #[test]
    fn unparseable_port_is_an_error() {
        let err = from_map(&[("PORT", "eighty")]).err().unwrap();
        assert!(err.to_string().contains("PORT"));
    }
}
