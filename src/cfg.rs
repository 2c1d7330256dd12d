#![allow(clippy::str_to_string)]
use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde::Deserialize;
use serde_valid::toml::FromTomlStr;
use serde_valid::Validate;
use std::path::PathBuf;

use crate::consts::DEFAULT_LABEL;
use crate::filesystems::{FsKind, ALL};

const DEFAULT_CFG_PATH: &str = "/etc/driveforge.toml";

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
pub struct Install {
    /// Filesystems the selector may pick from (and explicit choices must be in).
    #[validate(min_items = 1)]
    #[serde(default = "_all_filesystems")]
    pub allowed_filesystems: Vec<FsKind>,
    #[serde(default = "_default_label")]
    pub default_label: String,
}

fn _all_filesystems() -> Vec<FsKind> {
    ALL.to_vec()
}

fn _default_label() -> String {
    DEFAULT_LABEL.into()
}

impl Default for Install {
    fn default() -> Self {
        Self {
            allowed_filesystems: _all_filesystems(),
            default_label: _default_label(),
        }
    }
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct Bootloader {
    /// Override for the bundled UEFI boot stub image.
    pub bridge_image: Option<PathBuf>,
}

#[derive(Deserialize, Validate, Default, Debug, Clone, PartialEq, Eq)]
pub struct DriveforgeConfig {
    #[serde(default)]
    #[validate]
    pub install: Install,
    #[serde(default)]
    pub bootloader: Bootloader,
}

/// # Errors
/// - config file named by `DRIVEFORGE_CONFIG` cannot be read or parsed
#[allow(clippy::module_name_repetitions)]
#[tracing::instrument]
pub fn get_cfg() -> Result<DriveforgeConfig> {
    let path = std::env::var("DRIVEFORGE_CONFIG");
    match &path {
        Err(std::env::VarError::NotUnicode(s)) => {
            tracing::error!(?s, "Cannot parse DRIVEFORGE_CONFIG due to invalid unicode");
            tracing::debug!("Falling back to {DEFAULT_CFG_PATH}");
        }
        Ok(p) => tracing::debug!("Using DRIVEFORGE_CONFIG={p}"),
        Err(std::env::VarError::NotPresent) => tracing::trace!("Using {DEFAULT_CFG_PATH}"),
    }
    let explicit = path.is_ok();
    let path = path.as_deref().unwrap_or(DEFAULT_CFG_PATH);
    let toml = match std::fs::read_to_string(path) {
        Ok(toml) => toml,
        Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {path}, using defaults");
            return Ok(DriveforgeConfig::default());
        }
        Err(e) => return Err(eyre!("Cannot read config file at {path:?}").wrap_err(e)),
    };
    Ok(DriveforgeConfig::from_toml_str(&toml)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfg() {
        assert_eq!(
            DriveforgeConfig::from_toml_str(
                r#"
                [install]
                allowed_filesystems = ["ntfs", "exfat"]
                default_label = "WINUSB"
                "#
            )
            .unwrap(),
            DriveforgeConfig {
                install: Install {
                    allowed_filesystems: vec![FsKind::Ntfs, FsKind::Exfat],
                    default_label: "WINUSB".into(),
                },
                bootloader: Bootloader::default(),
            },
        );
    }

    #[test]
    fn empty_cfg_gets_defaults() {
        let cfg = DriveforgeConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.install.allowed_filesystems.len(), ALL.len());
        assert_eq!(cfg.install.default_label, DEFAULT_LABEL);
    }

    #[test]
    fn empty_allowed_list_is_invalid() {
        assert!(DriveforgeConfig::from_toml_str(
            r#"
            [install]
            allowed_filesystems = []
            "#
        )
        .is_err());
    }
}
