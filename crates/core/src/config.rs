use std::env;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_PIP_PROGRAM: &str = "pip";
const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 600;
const DEFAULT_PULL: bool = true;
const DEFAULT_PACKAGE_INDEX: &str = "https://pypi.org/simple/";
const MAX_INSTALL_TIMEOUT_SECS: u64 = 6 * 3600;

/// Where base image references are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSourceKind {
    /// Local Docker daemon, pulling when the image is missing
    Docker,
    /// Static reference → digest table, no network
    Pinned,
}

impl ImageSourceKind {
    fn from_env() -> Self {
        match env::var("SLIPWAY_IMAGE_SOURCE").ok().as_deref() {
            Some(m) if m.eq_ignore_ascii_case("pinned") => ImageSourceKind::Pinned,
            _ => ImageSourceKind::Docker,
        }
    }
}

impl fmt::Display for ImageSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSourceKind::Docker => f.write_str("docker"),
            ImageSourceKind::Pinned => f.write_str("pinned"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },
}

#[derive(Debug, Clone)]
pub struct SlipwayConfig {
    pub cache_dir: PathBuf,
    pub log_level: String,
    pub image_source: ImageSourceKind,
    pub pinned_images: Option<PathBuf>,
    pub pull: bool,
    pub pip_program: String,
    pub install_timeout_secs: u64,
    pub package_index: String,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("slipway"))
        .unwrap_or_else(|| env::temp_dir().join("slipway-cache"))
}

impl Default for SlipwayConfig {
    fn default() -> Self {
        let cache_dir = env::var("SLIPWAY_CACHE_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_dir);

        let log_level = env::var("SLIPWAY_LOG_LEVEL")
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
            .to_lowercase();

        let pinned_images = env::var("SLIPWAY_PINNED_IMAGES").ok().map(PathBuf::from);

        let pull = env::var("SLIPWAY_PULL")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(DEFAULT_PULL);

        let pip_program =
            env::var("SLIPWAY_PIP").unwrap_or_else(|_| DEFAULT_PIP_PROGRAM.to_string());

        let install_timeout_secs = env::var("SLIPWAY_INSTALL_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_INSTALL_TIMEOUT_SECS);

        let package_index =
            env::var("SLIPWAY_PACKAGE_INDEX").unwrap_or_else(|_| DEFAULT_PACKAGE_INDEX.to_string());

        Self {
            cache_dir,
            log_level,
            image_source: ImageSourceKind::from_env(),
            pinned_images,
            pull,
            pip_program,
            install_timeout_secs,
            package_index,
        }
    }
}

impl SlipwayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.install_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "Install timeout must be at least 1 second".to_string(),
            ));
        }
        if self.install_timeout_secs > MAX_INSTALL_TIMEOUT_SECS {
            return Err(ConfigError::ValidationFailed(
                "Install timeout cannot exceed 6 hours".to_string(),
            ));
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        if self.pip_program.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "Installer program cannot be empty".to_string(),
            ));
        }

        if self.image_source == ImageSourceKind::Pinned && self.pinned_images.is_none() {
            return Err(ConfigError::ValidationFailed(
                "SLIPWAY_PINNED_IMAGES must point to a pin file when SLIPWAY_IMAGE_SOURCE=pinned"
                    .to_string(),
            ));
        }

        if !self.package_index.starts_with("http://") && !self.package_index.starts_with("https://")
        {
            return Err(ConfigError::ParseError {
                field: "SLIPWAY_PACKAGE_INDEX".to_string(),
                error: format!("not an http(s) URL: {}", self.package_index),
            });
        }

        Ok(())
    }

    pub fn to_display_map(&self) -> std::collections::BTreeMap<String, String> {
        let mut map = std::collections::BTreeMap::new();
        map.insert("cache_dir".to_string(), self.cache_dir.display().to_string());
        map.insert("log_level".to_string(), self.log_level.clone());
        map.insert("image_source".to_string(), self.image_source.to_string());
        map.insert(
            "pinned_images".to_string(),
            self.pinned_images
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(none)".to_string()),
        );
        map.insert("pull".to_string(), self.pull.to_string());
        map.insert("pip_program".to_string(), self.pip_program.clone());
        map.insert(
            "install_timeout_secs".to_string(),
            self.install_timeout_secs.to_string(),
        );
        map.insert("package_index".to_string(), self.package_index.clone());
        map
    }
}

impl fmt::Display for SlipwayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Slipway Configuration:")?;
        writeln!(f, "  Cache Dir: {}", self.cache_dir.display())?;
        writeln!(f, "  Log Level: {}", self.log_level)?;
        writeln!(f, "  Image Source: {}", self.image_source)?;
        if let Some(pins) = &self.pinned_images {
            writeln!(f, "  Pinned Images: {}", pins.display())?;
        }
        writeln!(f, "  Pull Missing Images: {}", self.pull)?;
        writeln!(f, "  Installer: {}", self.pip_program)?;
        writeln!(f, "  Install Timeout: {}s", self.install_timeout_secs)?;
        writeln!(f, "  Package Index: {}", self.package_index)?;
        Ok(())
    }
}
