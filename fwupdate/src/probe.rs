// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Chip state probe: issue the vendor info request (1.2 / boot loader) or
//! the capability queries (2.0) and reduce the replies into [`TpmState`].

use crate::commands::TpmCommandError;
use crate::commands::TpmCommands;
use crate::error::FlowError;
use crate::fieldupgrade;
use crate::fieldupgrade::FieldUpgradeInfo;
use crate::fieldupgrade::OperationMode;
use crate::fieldupgrade::KEY_DIGEST_SIZE;
use crate::tpm12proto;
use crate::tpm20proto;
use crate::tpm20proto::ResponseCode;
use crate::tpm_device::TpmTransport;

/// Flat summary of the probed chip. Created once per run; read-only
/// afterwards.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TpmState {
    pub is_12: bool,
    pub is_12_owned: bool,
    pub has_deferred_pp: bool,
    pub is_20: bool,
    pub is_20_in_failure_mode: bool,
    pub is_20_restart_required: bool,
    pub is_boot_loader: bool,
    pub is_infineon: bool,
    pub is_unsupported_chip: bool,
    pub platform_auth_empty: bool,
    pub platform_hierarchy_enabled: bool,
    /// Version name as reported by the chip, e.g. `7.85.4555.0`.
    pub firmware_version: String,
    /// Updates left before the chip refuses further upgrades; 0 blocks.
    pub remaining_updates: u32,
    /// Largest data block the chip accepts per transfer command.
    pub max_data_size: u16,
    /// Decrypt-key fingerprints provisioned in the chip.
    pub key_digests: Vec<[u8; KEY_DIGEST_SIZE]>,
}

impl TpmState {
    pub fn family_str(&self) -> Option<&'static str> {
        if self.is_12 {
            Some("TPM12")
        } else if self.is_20 {
            Some("TPM20")
        } else {
            None
        }
    }
}

/// Probe the chip. The first exchange is the 1.2-format vendor info request;
/// a 2.0 chip rejects the 1.2 tag with `TPM_BADTAG`, which routes to the
/// capability-based probe.
pub fn probe_state<T: TpmTransport>(
    commands: &mut TpmCommands<T>,
) -> Result<TpmState, FlowError> {
    match commands.field_upgrade_info_request() {
        Ok(info) => Ok(reduce_info(&info)),
        Err(TpmCommandError::TpmCommandFailed { response_code })
            if response_code == tpm12proto::TPM_BAD_TAG =>
        {
            probe_state_20(commands)
        }
        Err(TpmCommandError::TpmCommandFailed { response_code })
            if response_code == tpm12proto::TPM_BAD_ORDINAL =>
        {
            // A 1.2 chip without the vendor command group.
            tracing::debug!("chip rejected the vendor info request ordinal");
            Ok(TpmState::default())
        }
        Err(err) => Err(err.into()),
    }
}

fn probe_state_20<T: TpmTransport>(
    commands: &mut TpmCommands<T>,
) -> Result<TpmState, FlowError> {
    let caps = match commands.get_capability(
        tpm20proto::TPM_CAP_TPM_PROPERTIES,
        tpm20proto::TPM_PT_MANUFACTURER,
        tpm20proto::protocol::MAX_TAGGED_PROPERTIES as u32,
    ) {
        Ok(caps) => caps,
        Err(TpmCommandError::TpmCommandFailed { response_code })
            if response_code == ResponseCode::Failure as u32 =>
        {
            // The chip answers nothing but GetTestResult and GetCapability
            // in failure mode; record what the self test reports.
            let test_result = commands.get_test_result().unwrap_or(0);
            tracing::warn!(test_result, "TPM2.0 is in failure mode");
            return Ok(TpmState {
                is_20: true,
                is_20_in_failure_mode: true,
                is_infineon: true,
                ..Default::default()
            });
        }
        Err(err) => return Err(err.into()),
    };

    if caps.property(tpm20proto::TPM_PT_MANUFACTURER) != Some(tpm20proto::MANUFACTURER_IFX) {
        return Ok(TpmState::default());
    }

    // Fallback version from the fixed properties; the vendor info below
    // carries the canonical version name.
    let fallback_version = match (
        caps.property(tpm20proto::TPM_PT_FIRMWARE_VERSION_1),
        caps.property(tpm20proto::TPM_PT_FIRMWARE_VERSION_2),
    ) {
        (Some(v1), Some(v2)) => format!(
            "{}.{}.{}.{}",
            v1 >> 16,
            v1 & 0xffff,
            v2 >> 16,
            v2 & 0xffff
        ),
        _ => String::new(),
    };

    let vendor = commands.get_capability(tpm20proto::TPM_CAP_VENDOR_PROPERTY, 0, 1)?;
    let blob = vendor.vendor_blob.as_slice();
    let mut reader = crate::codec::Reader::new(blob);
    let mut info = FieldUpgradeInfo::unmarshal(&mut reader)
        .map_err(|err| FlowError::from(TpmCommandError::MalformedResponse(err)))?;
    if info.version_name.is_empty() {
        info.version_name = fallback_version;
    }
    Ok(reduce_info(&info))
}

/// The ordered classification: vendor, boot loader, family, everything else
/// unsupported. The first matching rule assigns the attributes and stops.
fn reduce_info(info: &FieldUpgradeInfo) -> TpmState {
    let mut state = TpmState {
        is_infineon: true,
        firmware_version: info.version_name.clone(),
        remaining_updates: info.update_counter as u32,
        max_data_size: info.max_data_size,
        key_digests: info.key_digests.clone(),
        ..Default::default()
    };

    match OperationMode::from_u8(info.operation_mode) {
        Some(OperationMode::BootLoader) => {
            state.is_boot_loader = true;
            return state;
        }
        Some(_) => {}
        None => {
            state.is_unsupported_chip = true;
            return state;
        }
    }

    match info.family {
        fieldupgrade::FAMILY_TPM12 => {
            state.is_12 = true;
            state.is_12_owned = info.flags.owner_installed();
            state.has_deferred_pp = info.flags.deferred_pp_set();
        }
        fieldupgrade::FAMILY_TPM20 => {
            state.is_20 = true;
            state.is_20_in_failure_mode =
                info.operation_mode == OperationMode::FailureMode as u8;
            state.is_20_restart_required =
                info.operation_mode == OperationMode::RestartRequired as u8;
            state.platform_auth_empty = info.flags.platform_auth_empty();
            state.platform_hierarchy_enabled = info.flags.platform_hierarchy_enabled();
        }
        _ => state.is_unsupported_chip = true,
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fieldupgrade::InfoFlags;
    use crate::test_support::*;

    fn info_12(owned: bool, deferred_pp: bool) -> FieldUpgradeInfo {
        FieldUpgradeInfo {
            max_data_size: 1024,
            family: fieldupgrade::FAMILY_TPM12,
            operation_mode: OperationMode::Operational as u8,
            flags: InfoFlags::new()
                .with_owner_installed(owned)
                .with_deferred_pp_set(deferred_pp),
            update_counter: 3,
            version_name: "4.40.119.0".to_string(),
            key_digests: vec![],
        }
    }

    fn info_20() -> FieldUpgradeInfo {
        FieldUpgradeInfo {
            max_data_size: 1024,
            family: fieldupgrade::FAMILY_TPM20,
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
    fn probe_12_unowned() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![reply_12(
            0,
            &info_bytes(&info_12(false, true)),
        )]));
        let state = probe_state(&mut commands).unwrap();
        assert!(state.is_infineon);
        assert!(state.is_12);
        assert!(!state.is_12_owned);
        assert!(state.has_deferred_pp);
        assert!(!state.is_20);
        assert_eq!(state.remaining_updates, 3);
        assert_eq!(state.family_str(), Some("TPM12"));
    }

    #[test]
    fn probe_12_owned() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![reply_12(
            0,
            &info_bytes(&info_12(true, false)),
        )]));
        let state = probe_state(&mut commands).unwrap();
        assert!(state.is_12_owned);
        assert!(!state.has_deferred_pp);
    }

    #[test]
    fn probe_20_operational() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![
            reply_12(tpm12proto::TPM_BAD_TAG, &[]),
            props_cap_reply(&[
                (tpm20proto::TPM_PT_MANUFACTURER, tpm20proto::MANUFACTURER_IFX),
                (tpm20proto::TPM_PT_FIRMWARE_VERSION_1, 0x0007_0055),
                (tpm20proto::TPM_PT_FIRMWARE_VERSION_2, 0x11cb_0000),
            ]),
            vendor_cap_reply(&info_20()),
        ]));
        let state = probe_state(&mut commands).unwrap();
        assert!(state.is_20);
        assert!(state.is_infineon);
        assert!(state.platform_auth_empty);
        assert!(state.platform_hierarchy_enabled);
        assert_eq!(state.remaining_updates, 64);
        assert_eq!(state.firmware_version, "7.85.4555.0");
        assert_eq!(state.family_str(), Some("TPM20"));
    }

    #[test]
    fn probe_non_ifx_12() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![reply_12(
            tpm12proto::TPM_BAD_ORDINAL,
            &[],
        )]));
        let state = probe_state(&mut commands).unwrap();
        assert!(!state.is_infineon);
        assert!(!state.is_12 && !state.is_20);
    }

    #[test]
    fn probe_non_ifx_20_stops_early() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![
            reply_12(tpm12proto::TPM_BAD_TAG, &[]),
            props_cap_reply(&[(tpm20proto::TPM_PT_MANUFACTURER, 0x4e544300)]),
        ]));
        let state = probe_state(&mut commands).unwrap();
        assert!(!state.is_infineon);
        // No further capability queries after the vendor check fails.
        assert_eq!(commands.transport_mut().commands.len(), 2);
    }

    #[test]
    fn probe_boot_loader() {
        let mut info = info_20();
        info.operation_mode = OperationMode::BootLoader as u8;
        info.family = 0;
        let mut commands =
            TpmCommands::new(ScriptedTransport::new(vec![reply_12(0, &info_bytes(&info))]));
        let state = probe_state(&mut commands).unwrap();
        assert!(state.is_boot_loader);
        assert!(!state.is_12 && !state.is_20);
        assert!(!state.is_unsupported_chip);
    }

    #[test]
    fn probe_20_failure_mode() {
        let mut test_result_body = Vec::new();
        test_result_body.extend_from_slice(&0u16.to_be_bytes()); // empty outData
        test_result_body.extend_from_slice(&0x0101u32.to_be_bytes());
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![
            reply_12(tpm12proto::TPM_BAD_TAG, &[]),
            reply_20(0x8001, ResponseCode::Failure as u32, &[]),
            reply_20(0x8001, 0, &test_result_body),
        ]));
        let state = probe_state(&mut commands).unwrap();
        assert!(state.is_20);
        assert!(state.is_20_in_failure_mode);
    }

    #[test]
    fn probe_unknown_family_is_unsupported() {
        let mut info = info_20();
        info.family = 0x7777;
        let mut commands =
            TpmCommands::new(ScriptedTransport::new(vec![reply_12(0, &info_bytes(&info))]));
        let state = probe_state(&mut commands).unwrap();
        assert!(state.is_unsupported_chip);
    }
}
