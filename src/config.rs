use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config profile `{0}` is not a directory")]
    ProfileMissing(PathBuf),

    #[error("config section `{section}` missing (expected {path})")]
    SectionMissing { section: String, path: PathBuf },

    #[error("config section `{section}` unreadable: {source}")]
    Io {
        section: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config section `{section}` malformed: {source}")]
    Malformed {
        section: String,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    /// Section name the error belongs to, if it names one.
    pub fn section(&self) -> Option<&str> {
        match self {
            ConfigError::ProfileMissing(_) => None,
            ConfigError::SectionMissing { section, .. }
            | ConfigError::Io { section, .. }
            | ConfigError::Malformed { section, .. } => Some(section),
        }
    }
}

/// Handle to a configuration profile: a directory holding one TOML file per
/// section (`<dir>/<section>.toml`). Immutable once opened; sections are read
/// on demand into whatever struct the caller asks for, so the same section
/// can be read more than once into different shapes.
#[derive(Debug, Clone)]
pub struct ConfigDir {
    dir: PathBuf,
}

impl ConfigDir {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(ConfigError::ProfileMissing(dir));
        }
        Ok(Self { dir })
    }

    pub fn read_section<T: DeserializeOwned>(&self, section: &str) -> Result<T, ConfigError> {
        let path = self.section_path(section);
        if !path.is_file() {
            return Err(ConfigError::SectionMissing {
                section: section.to_string(),
                path,
            });
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            section: section.to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Malformed {
            section: section.to_string(),
            source,
        })
    }

    pub fn section_path(&self, section: &str) -> PathBuf {
        self.dir.join(format!("{section}.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

/// Application-wide settings, read from the `app` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_app_name")]
    pub name: String,
    pub port: u16,
}

fn default_app_name() -> String {
    "gantry".to_string()
}

impl fmt::Display for AppSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (port {})", self.name, self.port)
    }
}
