//! Endpoint and timeout configuration
//!
//! Loaded from `~/.config/tubelens/config.toml` (or an explicit path), with
//! `TUBELENS_BASE_URL` taking precedence over the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::error::ConfigError;
use crate::stages::{StageDefinition, INSIGHTS_STAGES, METADATA_STAGES};

/// Environment variable overriding `base_url`
pub const ENV_BASE_URL: &str = "TUBELENS_BASE_URL";

const DEFAULT_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FALLBACK_TIMEOUT_SECS: u64 = 120;

/// Which dashboard panel a request comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    /// Title/description/tag generation for selected videos
    Metadata,
    /// Performance analysis over channel analytics
    Insights,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 2] = [AnalysisKind::Metadata, AnalysisKind::Insights];

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisKind::Metadata => "metadata",
            AnalysisKind::Insights => "insights",
        }
    }

    /// Compile-time stage list for this kind
    pub fn stages(self) -> &'static [StageDefinition] {
        match self {
            AnalysisKind::Metadata => METADATA_STAGES,
            AnalysisKind::Insights => INSIGHTS_STAGES,
        }
    }

    fn default_stream_path(self) -> &'static str {
        match self {
            AnalysisKind::Metadata => "api/ai/metadata/stream",
            AnalysisKind::Insights => "api/ai/insights/stream",
        }
    }

    fn default_fallback_path(self) -> &'static str {
        match self {
            AnalysisKind::Metadata => "api/ai/metadata",
            AnalysisKind::Insights => "api/ai/insights",
        }
    }
}

impl std::fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "metadata" => Ok(AnalysisKind::Metadata),
            "insights" => Ok(AnalysisKind::Insights),
            other => Err(format!(
                "unknown analysis kind '{}' (expected metadata or insights)",
                other
            )),
        }
    }
}

/// Optional per-kind path overrides, relative to `base_url`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointOverrides {
    pub stream: Option<String>,
    pub fallback: Option<String>,
}

/// Resolved URLs for one analysis kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub stream: Url,
    pub fallback: Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub connect_timeout_secs: u64,
    /// Overall timeout for the non-streaming request; the stream has none
    pub fallback_timeout_secs: u64,
    /// Show all stages completed after a successful fallback
    pub fallback_completes_stages: bool,
    pub metadata: EndpointOverrides,
    pub insights: EndpointOverrides,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            fallback_timeout_secs: DEFAULT_FALLBACK_TIMEOUT_SECS,
            fallback_completes_stages: true,
            metadata: EndpointOverrides::default(),
            insights: EndpointOverrides::default(),
        }
    }
}

impl Config {
    /// `<config_dir>/tubelens/config.toml`, if a config dir exists
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tubelens").join("config.toml"))
    }

    /// Load from `path` or the default location, then apply env overrides
    ///
    /// A missing or empty file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);

        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file at {:?}", path))?;
                info!("Loaded config from {:?}", path);
                Self::from_toml_str(&content)
                    .with_context(|| format!("Failed to parse config file at {:?}", path))?
            }
            Some(path) => {
                debug!("No config file at {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_base_url_override(std::env::var(ENV_BASE_URL).ok());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(content)?)
    }

    /// Replace `base_url` with a non-empty override
    pub fn apply_base_url_override(&mut self, value: Option<String>) {
        if let Some(url) = value.filter(|v| !v.trim().is_empty()) {
            debug!("Base URL overridden: {}", url);
            self.base_url = url.trim().to_string();
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback_timeout_secs)
    }

    /// Resolve the streaming and fallback URLs for `kind`
    pub fn endpoints(&self, kind: AnalysisKind) -> std::result::Result<Endpoints, ConfigError> {
        let mut base = Url::parse(&self.base_url).map_err(|source| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            source,
        })?;
        // Keep any path prefix on the base when joining relative paths
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let overrides = match kind {
            AnalysisKind::Metadata => &self.metadata,
            AnalysisKind::Insights => &self.insights,
        };
        let stream = overrides
            .stream
            .as_deref()
            .unwrap_or(kind.default_stream_path());
        let fallback = overrides
            .fallback
            .as_deref()
            .unwrap_or(kind.default_fallback_path());

        Ok(Endpoints {
            stream: join(&base, stream)?,
            fallback: join(&base, fallback)?,
        })
    }
}

fn join(base: &Url, path: &str) -> std::result::Result<Url, ConfigError> {
    base.join(path.trim_start_matches('/'))
        .map_err(|source| ConfigError::InvalidPath {
            path: path.to_string(),
            source,
        })
}
