// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Vendor field-upgrade types shared by the 1.2 ordinal and the 2.0 vendor
//! command encodings. The same info structure is returned by both chip
//! generations and by the boot loader.

use crate::codec::CodecError;
use crate::codec::Reader;
use crate::codec::Writer;
use bitfield_struct::bitfield;

// Subcommand selector carried after the vendor ordinal / command code.
pub const SUBCMD_INFO_REQUEST: u8 = 0x10;
pub const SUBCMD_START: u8 = 0x34;
pub const SUBCMD_UPDATE: u8 = 0x35;
pub const SUBCMD_COMPLETE: u8 = 0x36;

/// Family code reported by the info structure and carried in firmware images.
pub const FAMILY_TPM12: u16 = 0x0001;
pub const FAMILY_TPM20: u16 = 0x0002;

/// SHA-256 fingerprint of a firmware decrypt key provisioned in the chip.
pub const KEY_DIGEST_SIZE: usize = 32;

/// Chip operation mode reported by the info request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationMode {
    Operational = 0,
    /// A prior update was interrupted; only field-upgrade commands work.
    BootLoader = 1,
    FailureMode = 2,
    RestartRequired = 3,
}

impl OperationMode {
    pub fn from_u8(val: u8) -> Option<OperationMode> {
        let ret = match val {
            0 => Self::Operational,
            1 => Self::BootLoader,
            2 => Self::FailureMode,
            3 => Self::RestartRequired,
            _ => return None,
        };
        Some(ret)
    }
}

#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct InfoFlags {
    pub owner_installed: bool,
    pub deferred_pp_set: bool,
    pub platform_auth_empty: bool,
    pub platform_hierarchy_enabled: bool,
    #[bits(12)]
    _reserved: u16,
}

/// Reply body of the field-upgrade info request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpgradeInfo {
    /// Largest data block the chip accepts per update command.
    pub max_data_size: u16,
    pub family: u16,
    pub operation_mode: u8,
    pub flags: InfoFlags,
    /// Updates left before the chip refuses further upgrades.
    pub update_counter: u16,
    /// ASCII version name, e.g. `7.85.4555.0`.
    pub version_name: String,
    /// Fingerprints of the decrypt keys provisioned in this chip.
    pub key_digests: Vec<[u8; KEY_DIGEST_SIZE]>,
}

impl FieldUpgradeInfo {
    pub fn marshal(&self, writer: &mut Writer<'_>) -> Result<(), CodecError> {
        writer.write_u16(self.max_data_size)?;
        writer.write_u16(self.family)?;
        writer.write_u8(self.operation_mode)?;
        writer.write_u16(self.flags.into_bits())?;
        writer.write_u16(self.update_counter)?;
        writer.write_sized_blob(self.version_name.as_bytes())?;
        writer.write_u16(self.key_digests.len() as u16)?;
        for digest in &self.key_digests {
            writer.write_bytes(digest)?;
        }
        Ok(())
    }

    pub fn unmarshal(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let max_data_size = reader.read_u16()?;
        let family = reader.read_u16()?;
        let operation_mode = reader.read_u8()?;
        let flags = InfoFlags::from_bits(reader.read_u16()?);
        let update_counter = reader.read_u16()?;
        let version_name = String::from_utf8_lossy(reader.read_sized_blob()?).into_owned();
        let digest_count = reader.read_u16()? as usize;
        let mut key_digests = Vec::with_capacity(digest_count);
        for _ in 0..digest_count {
            key_digests.push(reader.read_array::<KEY_DIGEST_SIZE>()?);
        }
        Ok(Self {
            max_data_size,
            family,
            operation_mode,
            flags,
            update_counter,
            version_name,
            key_digests,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> FieldUpgradeInfo {
        FieldUpgradeInfo {
            max_data_size: 1024,
            family: FAMILY_TPM20,
            operation_mode: OperationMode::Operational as u8,
            flags: InfoFlags::new()
                .with_platform_auth_empty(true)
                .with_platform_hierarchy_enabled(true),
            update_counter: 64,
            version_name: "7.85.4555.0".to_string(),
            key_digests: vec![[0x42; KEY_DIGEST_SIZE]],
        }
    }

    #[test]
    fn info_round_trip() {
        let info = sample_info();
        let mut buf = [0u8; 128];
        let mut writer = Writer::new(&mut buf);
        info.marshal(&mut writer).unwrap();
        let len = writer.len();

        let mut reader = Reader::new(&buf[..len]);
        let parsed = FieldUpgradeInfo::unmarshal(&mut reader).unwrap();
        assert_eq!(parsed, info);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn info_truncated_never_panics() {
        let info = sample_info();
        let mut buf = [0u8; 128];
        let mut writer = Writer::new(&mut buf);
        info.marshal(&mut writer).unwrap();
        let len = writer.len();
        for cut in 0..len {
            assert!(FieldUpgradeInfo::unmarshal(&mut Reader::new(&buf[..cut])).is_err());
        }
    }

    #[test]
    fn unknown_operation_mode() {
        assert_eq!(OperationMode::from_u8(1), Some(OperationMode::BootLoader));
        assert_eq!(OperationMode::from_u8(9), None);
    }
}
