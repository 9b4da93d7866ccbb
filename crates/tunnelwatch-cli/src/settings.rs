//! Tunnel settings storage
//!
//! Settings live in a single JSON file, ~/.tunnelwatch/settings.json by
//! default. The basic-auth password is stored obfuscated; files written before
//! versioning hold it in plain text and are migrated on first load.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tunnelwatch_codec::{CredentialCodec, OBFUSCATED_SCHEMA_VERSION};
use tunnelwatch_supervisor::TunnelConfiguration;

/// Current settings schema version
pub const SETTINGS_VERSION: u32 = OBFUSCATED_SCHEMA_VERSION;

/// Unversioned files predate obfuscation
const LEGACY_SETTINGS_VERSION: u32 = 1;

const REDACTED: &str = "********";

/// Everything the runner needs to supervise a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub tunnel: TunnelConfiguration,
    /// Port of the local service
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Port a reverse proxy exposes the service on, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
}

fn default_local_port() -> u16 {
    5000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfiguration::default(),
            local_port: default_local_port(),
            public_port: None,
        }
    }
}

impl Settings {
    /// Copy with secrets masked, for display
    pub fn redacted(&self) -> Self {
        let mask = |value: &str| {
            if value.is_empty() {
                String::new()
            } else {
                REDACTED.to_string()
            }
        };

        let mut redacted = self.clone();
        redacted.tunnel.token = mask(&self.tunnel.token);
        redacted.tunnel.auth_pass = mask(&self.tunnel.auth_pass);
        redacted
    }
}

/// On-disk layout
#[derive(Serialize, Deserialize)]
struct SettingsFile {
    #[serde(flatten)]
    settings: Settings,
    #[serde(default = "legacy_version")]
    settings_version: u32,
}

fn legacy_version() -> u32 {
    LEGACY_SETTINGS_VERSION
}

/// Settings file manager
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Store at the default location
    pub fn new() -> Result<Self> {
        Ok(Self {
            path: Self::default_path()?,
        })
    }

    /// Store at a custom location
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// ~/.tunnelwatch/settings.json
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".tunnelwatch").join("settings.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, migrating older files in place
    ///
    /// A missing file yields the defaults.
    pub fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            debug!("No settings file at {:?}, using defaults", self.path);
            return Ok(Settings::default());
        }

        let json = fs::read_to_string(&self.path)
            .context(format!("Failed to read settings file: {:?}", self.path))?;
        let mut file: SettingsFile = serde_json::from_str(&json)
            .context(format!("Failed to parse settings file: {:?}", self.path))?;

        if let Some(encoded) =
            CredentialCodec::migrate(&file.settings.tunnel.auth_pass, file.settings_version)
                .context("Failed to encode stored password")?
        {
            info!(
                "Migrating settings from version {} to {}",
                file.settings_version, SETTINGS_VERSION
            );
            file.settings.tunnel.auth_pass = encoded;
            file.settings_version = SETTINGS_VERSION;
            self.write(&file)?;
        }

        let mut settings = file.settings;
        settings.tunnel.auth_pass = CredentialCodec::deobfuscate(&settings.tunnel.auth_pass);
        Ok(settings)
    }

    /// Save settings, obfuscating the password
    pub fn save(&self, settings: &Settings) -> Result<()> {
        let mut stored = settings.clone();
        stored.tunnel.auth_pass = CredentialCodec::obfuscate(&settings.tunnel.auth_pass)
            .context("Failed to encode password")?;

        self.write(&SettingsFile {
            settings: stored,
            settings_version: SETTINGS_VERSION,
        })
    }

    fn write(&self, file: &SettingsFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create settings directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(file).context("Failed to serialize settings")?;
        fs::write(&self.path, json)
            .context(format!("Failed to write settings file: {:?}", self.path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.local_port, 5000);
        assert!(settings.public_port.is_none());
        assert_eq!(settings.tunnel, TunnelConfiguration::default());
    }

    #[test]
    fn test_redacted() {
        let mut settings = Settings::default();
        settings.tunnel.token = "2abcdef".to_string();
        settings.tunnel.auth_name = "octo".to_string();
        settings.tunnel.auth_pass = "secret".to_string();

        let redacted = settings.redacted();
        assert_eq!(redacted.tunnel.token, REDACTED);
        assert_eq!(redacted.tunnel.auth_pass, REDACTED);
        assert_eq!(redacted.tunnel.auth_name, "octo");

        // Empty secrets stay visibly empty
        assert!(Settings::default().redacted().tunnel.token.is_empty());
    }

    #[test]
    fn test_flattened_layout() {
        let json = serde_json::to_value(SettingsFile {
            settings: Settings::default(),
            settings_version: SETTINGS_VERSION,
        })
        .unwrap();

        assert_eq!(json["region"], "us");
        assert_eq!(json["local_port"], 5000);
        assert_eq!(json["settings_version"], SETTINGS_VERSION);
        assert!(json.get("public_port").is_none());
        assert!(json.get("tunnel").is_none());
    }
}
