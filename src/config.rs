use std::{env, path::PathBuf, time::Duration};

use tracing::debug;

use crate::error::RelayError;

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_BODY_LIMIT_MB: usize = 10;
const DEFAULT_CLEANUP_DELAY_SECS: u64 = 30;
const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DETECTION_IMAGE_SIZE: u32 = 200;

pub const ENV_DETECTION_URL: &str = "FASTAPI_YOLO_URL";
pub const ENV_EMBEDDING_URL: &str = "FASTAPI_DINO_URL";
pub const ENV_SEARCH_URL: &str = "FASTAPI_FAISS_URL";

/// Runtime settings, read once at startup and handed to the router.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub upload_dir: PathBuf,
    pub public_dir: PathBuf,
    pub catalogue_dir: PathBuf,
    pub detection_url: Option<String>,
    pub embedding_url: Option<String>,
    pub search_url: Option<String>,
    pub frontend_url: Option<String>,
    pub cleanup_delay: Duration,
    pub service_timeout: Duration,
    pub resize_before_detection: bool,
    pub detection_image_size: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let body_limit_mb: usize = parse_or(&get, "BODY_LIMIT_MB", DEFAULT_BODY_LIMIT_MB)?;

        let config = AppConfig {
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
            body_limit_bytes: body_limit_mb * 1024 * 1024,
            upload_dir: get("UPLOAD_DIR").unwrap_or_else(|| "uploads".into()).into(),
            public_dir: get("PUBLIC_DIR").unwrap_or_else(|| "public".into()).into(),
            catalogue_dir: get("CATALOGUE_DIR")
                .unwrap_or_else(|| "catalogue".into())
                .into(),
            detection_url: get(ENV_DETECTION_URL),
            embedding_url: get(ENV_EMBEDDING_URL),
            search_url: get(ENV_SEARCH_URL),
            frontend_url: get("FRONTEND_URL"),
            cleanup_delay: Duration::from_secs(parse_or(
                &get,
                "CLEANUP_DELAY_SECS",
                DEFAULT_CLEANUP_DELAY_SECS,
            )?),
            service_timeout: Duration::from_secs(parse_or(
                &get,
                "SERVICE_TIMEOUT_SECS",
                DEFAULT_SERVICE_TIMEOUT_SECS,
            )?),
            resize_before_detection: parse_or(&get, "RESIZE_BEFORE_DETECTION", false)?,
            detection_image_size: parse_or(
                &get,
                "DETECTION_IMAGE_SIZE",
                DEFAULT_DETECTION_IMAGE_SIZE,
            )?,
        };

        if config.detection_image_size == 0 {
            return Err(RelayError::Configuration(
                "DETECTION_IMAGE_SIZE must be a positive integer".into(),
            ));
        }

        Ok(config)
    }

    /// Creates the upload, public and catalogue directories if missing.
    pub async fn ensure_dirs_exist(&self) -> std::io::Result<()> {
        for dir in [&self.upload_dir, &self.public_dir, &self.catalogue_dir] {
            if !dir.exists() {
                debug!("Creating directory {}", dir.display());
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, RelayError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            RelayError::Configuration(format!("{} has an invalid value: {}", key, raw))
        }),
        None => Ok(default),
    }
}
