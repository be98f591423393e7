// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! INI-style configuration parsing: the generic section/key/value walk, the
//! tool settings sections, and the update-flow config file.

use crate::UpdateType;
use thiserror::Error;

// Update config file sections and keys.
pub const SECTION_UPDATE_TYPE: &str = "UpdateType";
pub const KEY_UPDATE_TYPE_TPM12: &str = "tpm12";
pub const KEY_UPDATE_TYPE_TPM20: &str = "tpm20";
pub const SECTION_TARGET_FIRMWARE: &str = "TargetFirmware";
pub const KEY_TARGET_FIRMWARE_VERSION_LPC: &str = "version_SLB966x";
pub const KEY_TARGET_FIRMWARE_VERSION_SPI: &str = "version_SLB9670";
pub const SECTION_FIRMWARE_FOLDER: &str = "FirmwareFolder";
pub const KEY_FIRMWARE_FOLDER_PATH: &str = "path";

// Tool settings sections and keys.
pub const SECTION_LOGGING: &str = "LOGGING";
pub const KEY_LOGGING_LEVEL: &str = "LEVEL";
pub const KEY_LOGGING_PATH: &str = "PATH";
pub const KEY_LOGGING_MAXSIZE: &str = "MAXSIZE";
pub const SECTION_ACCESS_MODE: &str = "ACCESS_MODE";
pub const KEY_ACCESS_MODE_LOCALITY: &str = "LOCALITY";
pub const SECTION_TPM_DEVICE_ACCESS: &str = "TPM_DEVICE_ACCESS";
pub const KEY_TPM_DEVICE_ACCESS_MODE: &str = "MODE";

// CLI/option value names for the update types.
pub const OPTION_TPM12_PP: &str = "tpm12-PP";
pub const OPTION_TPM12_TAKEOWNERSHIP: &str = "tpm12-takeownership";
pub const OPTION_TPM20_EMPTYPLATFORMAUTH: &str = "tpm20-emptyplatformauth";
pub const OPTION_CONFIG_FILE: &str = "config-file";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("line {line} is not a section header or a key=value setting")]
    Syntax { line: usize },
    #[error("invalid value '{value}' for setting {section}/{key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
    #[error("mandatory setting {section}/{key} is missing")]
    MissingSetting {
        section: &'static str,
        key: &'static str,
    },
}

/// Walk an INI document, calling back for each section/key/value triple.
/// Blank lines and `;`/`#` comments are skipped; keys before any section
/// header report an empty section name.
pub fn walk_ini(
    content: &str,
    mut visit: impl FnMut(&str, &str, &str) -> Result<(), ConfigError>,
) -> Result<(), ConfigError> {
    let mut section = String::new();
    for (index, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[') {
            match name.strip_suffix(']') {
                Some(name) => section = name.trim().to_string(),
                None => return Err(ConfigError::Syntax { line: index + 1 }),
            }
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => visit(&section, key.trim(), value.trim())?,
            None => return Err(ConfigError::Syntax { line: index + 1 }),
        }
    }
    Ok(())
}

/// Settings of the update-flow config file (`-update config-file`).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UpdateConfig {
    pub update_type12: Option<UpdateType>,
    pub update_type20: Option<UpdateType>,
    pub target_version_lpc: Option<String>,
    pub target_version_spi: Option<String>,
    pub firmware_folder: Option<String>,
}

impl UpdateConfig {
    /// Parse and finalize: all five update settings are mandatory.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = UpdateConfig::default();
        walk_ini(content, |section, key, value| {
            config.visit(section, key, value)
        })?;
        config.finalize()?;
        Ok(config)
    }

    // Section dispatch is exclusive by construction. The reference tool
    // cascades through the section checks, which would feed a key name
    // appearing in two sections to both handlers.
    fn visit(&mut self, section: &str, key: &str, value: &str) -> Result<(), ConfigError> {
        match section {
            SECTION_UPDATE_TYPE => match key {
                KEY_UPDATE_TYPE_TPM12 => {
                    self.update_type12 = Some(match value {
                        OPTION_TPM12_PP => UpdateType::Tpm12Pp,
                        OPTION_TPM12_TAKEOWNERSHIP => UpdateType::Tpm12TakeOwnership,
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                section: section.to_string(),
                                key: key.to_string(),
                                value: value.to_string(),
                            })
                        }
                    });
                }
                KEY_UPDATE_TYPE_TPM20 => {
                    self.update_type20 = Some(match value {
                        OPTION_TPM20_EMPTYPLATFORMAUTH => UpdateType::Tpm20EmptyPlatformAuth,
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                section: section.to_string(),
                                key: key.to_string(),
                                value: value.to_string(),
                            })
                        }
                    });
                }
                // Unknown setting in this section, ignore it.
                _ => {}
            },
            SECTION_TARGET_FIRMWARE => match key {
                KEY_TARGET_FIRMWARE_VERSION_LPC => {
                    self.target_version_lpc = Some(value.to_string())
                }
                KEY_TARGET_FIRMWARE_VERSION_SPI => {
                    self.target_version_spi = Some(value.to_string())
                }
                _ => {}
            },
            SECTION_FIRMWARE_FOLDER => {
                if key == KEY_FIRMWARE_FOLDER_PATH {
                    self.firmware_folder = Some(value.to_string());
                }
            }
            // Unknown section, ignore it.
            _ => {}
        }
        Ok(())
    }

    fn finalize(&self) -> Result<(), ConfigError> {
        let mandatory: [(&'static str, &'static str, bool); 5] = [
            (
                SECTION_UPDATE_TYPE,
                KEY_UPDATE_TYPE_TPM12,
                self.update_type12.is_some(),
            ),
            (
                SECTION_UPDATE_TYPE,
                KEY_UPDATE_TYPE_TPM20,
                self.update_type20.is_some(),
            ),
            (
                SECTION_TARGET_FIRMWARE,
                KEY_TARGET_FIRMWARE_VERSION_LPC,
                self.target_version_lpc.is_some(),
            ),
            (
                SECTION_TARGET_FIRMWARE,
                KEY_TARGET_FIRMWARE_VERSION_SPI,
                self.target_version_spi.is_some(),
            ),
            (
                SECTION_FIRMWARE_FOLDER,
                KEY_FIRMWARE_FOLDER_PATH,
                self.firmware_folder.is_some(),
            ),
        ];
        for (section, key, present) in mandatory {
            if !present {
                return Err(ConfigError::MissingSetting { section, key });
            }
        }
        Ok(())
    }
}

/// Tool settings recognized from the settings file: logging, locality, and
/// device access mode. Everything is optional here; defaults apply.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ToolConfig {
    pub logging_level: Option<u32>,
    pub logging_path: Option<String>,
    pub logging_max_size: Option<u32>,
    pub locality: Option<u8>,
    pub device_access_mode: Option<u32>,
}

impl ToolConfig {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = ToolConfig::default();
        walk_ini(content, |section, key, value| {
            let invalid = || ConfigError::InvalidValue {
                section: section.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            };
            match (section, key) {
                (SECTION_LOGGING, KEY_LOGGING_LEVEL) => {
                    config.logging_level = Some(value.parse().map_err(|_| invalid())?)
                }
                (SECTION_LOGGING, KEY_LOGGING_PATH) => {
                    config.logging_path = Some(value.to_string())
                }
                (SECTION_LOGGING, KEY_LOGGING_MAXSIZE) => {
                    config.logging_max_size = Some(value.parse().map_err(|_| invalid())?)
                }
                (SECTION_ACCESS_MODE, KEY_ACCESS_MODE_LOCALITY) => {
                    config.locality = Some(value.parse().map_err(|_| invalid())?)
                }
                (SECTION_TPM_DEVICE_ACCESS, KEY_TPM_DEVICE_ACCESS_MODE) => {
                    config.device_access_mode = Some(value.parse().map_err(|_| invalid())?)
                }
                _ => {}
            }
            Ok(())
        })?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = "\
; TPM firmware update settings
[UpdateType]
tpm12 = tpm12-PP
tpm20 = tpm20-emptyplatformauth

[TargetFirmware]
version_SLB966x = 4.43.257.0
version_SLB9670 = 7.85.4555.0

[FirmwareFolder]
path = firmware
";

    #[test]
    fn parse_full_config() {
        let config = UpdateConfig::parse(FULL_CONFIG).unwrap();
        assert_eq!(config.update_type12, Some(UpdateType::Tpm12Pp));
        assert_eq!(config.update_type20, Some(UpdateType::Tpm20EmptyPlatformAuth));
        assert_eq!(config.target_version_lpc.as_deref(), Some("4.43.257.0"));
        assert_eq!(config.target_version_spi.as_deref(), Some("7.85.4555.0"));
        assert_eq!(config.firmware_folder.as_deref(), Some("firmware"));
    }

    #[test]
    fn missing_mandatory_setting() {
        let content = FULL_CONFIG.replace("path = firmware\n", "");
        assert_eq!(
            UpdateConfig::parse(&content),
            Err(ConfigError::MissingSetting {
                section: SECTION_FIRMWARE_FOLDER,
                key: KEY_FIRMWARE_FOLDER_PATH,
            })
        );
    }

    #[test]
    fn invalid_update_type_value() {
        let content = FULL_CONFIG.replace("tpm12-PP", "tpm12-ownership");
        assert!(matches!(
            UpdateConfig::parse(&content),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn unknown_sections_and_keys_are_ignored() {
        let content = format!("{FULL_CONFIG}\n[Extra]\nkey = value\n\n[UpdateType]\nfuture = x\n");
        assert!(UpdateConfig::parse(&content).is_ok());
    }

    #[test]
    fn syntax_error_reports_line() {
        assert_eq!(
            walk_ini("[Section]\nnot a setting\n", |_, _, _| Ok(())),
            Err(ConfigError::Syntax { line: 2 })
        );
    }

    #[test]
    fn tool_config_settings() {
        let config = ToolConfig::parse(
            "[LOGGING]\nLEVEL = 4\nPATH = ./TPMFactoryUpd.log\nMAXSIZE = 1024\n\
             [ACCESS_MODE]\nLOCALITY = 0\n[TPM_DEVICE_ACCESS]\nMODE = 3\n",
        )
        .unwrap();
        assert_eq!(config.logging_level, Some(4));
        assert_eq!(config.logging_path.as_deref(), Some("./TPMFactoryUpd.log"));
        assert_eq!(config.locality, Some(0));
        assert_eq!(config.device_access_mode, Some(3));
    }
}
