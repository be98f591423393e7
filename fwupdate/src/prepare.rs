// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pre-update authorization: one routine per update flavor, plus the 1.2
//! clear-ownership flow. Any routine that created an authorization session
//! flushes it on every error exit.

use crate::commands::TpmCommandError;
use crate::commands::TpmCommands;
use crate::crypto;
use crate::error::ErrorCode;
use crate::error::FlowError;
use crate::probe::TpmState;
use crate::tpm12proto;
use crate::tpm12proto::Authdata;
use crate::tpm12proto::TpmKey12;
use crate::tpm20proto::CC_FIELD_UPGRADE_START_VENDOR;
use crate::tpm_device::TpmTransport;

/// SHA-1 of the documented default owner password. Ownership taken by this
/// tool always uses this value, so a later run (or clear-ownership) can
/// authorize against it. Embedded as data; never recomputed.
pub const OWNER_AUTH_HASH: Authdata = [
    0x67, 0x68, 0x03, 0x3e, 0x21, 0x64, 0x68, 0x24, 0x7b, 0xd0, 0x31, 0xa0, 0xa2, 0xd9, 0x87,
    0x6d, 0x79, 0x81, 0x8f, 0x8f,
];

/// The well-known all-zero SRK authorization.
pub const SRK_WELL_KNOWN_AUTH: Authdata = [0u8; 20];

fn chip_code(err: &TpmCommandError) -> Option<u32> {
    err.chip_code()
}

/// Prepare a 1.2 update via (deferred) physical presence.
///
/// `TSC_PhysicalPresence(CMD_ENABLE)` may fail with `TPM_BAD_PARAMETER` when
/// the command was already enabled and the lifetime lock is set in the
/// factory; that is not an error. `TPM_BAD_PARAMETER` on the `PRESENT` step
/// means physical presence is locked and deferred physical presence is the
/// only remaining path.
pub fn prepare_tpm12_physical_presence<T: TpmTransport>(
    commands: &mut TpmCommands<T>,
) -> Result<(), FlowError> {
    if let Err(err) = commands.tsc_physical_presence(tpm12proto::TPM_PHYSICAL_PRESENCE_CMD_ENABLE)
    {
        if chip_code(&err) != Some(tpm12proto::TPM_BAD_PARAMETER) {
            return Err(err.into());
        }
    }

    if let Err(err) = commands.tsc_physical_presence(tpm12proto::TPM_PHYSICAL_PRESENCE_PRESENT) {
        if chip_code(&err) == Some(tpm12proto::TPM_BAD_PARAMETER) {
            return Err(FlowError::new(
                ErrorCode::Tpm12DeferredPpRequired,
                "physical presence is locked and deferred physical presence is not set",
            ));
        }
        return Err(err.into());
    }

    // Latch deferred physical presence across the next reboot. From here on
    // the command sequence is expected to work, so everything is fatal.
    commands
        .set_capability(
            tpm12proto::TPM_SET_STCLEAR_DATA,
            tpm12proto::TPM_SD_DEFERREDPHYSICALPRESENCE,
            &[0x00, 0x00, 0x00, 0x01],
        )
        .map_err(FlowError::from)?;

    Ok(())
}

/// Prepare a 1.2 update by taking ownership with the built-in owner auth.
pub fn prepare_tpm12_ownership<T: TpmTransport>(
    commands: &mut TpmCommands<T>,
) -> Result<(), FlowError> {
    let pubek = commands.read_pubek().map_err(FlowError::from)?;
    let modulus = &pubek.pub_key.key;

    let enc_owner_auth = crypto::rsa_oaep_sha1_encrypt(modulus, &OWNER_AUTH_HASH)?;
    let enc_srk_auth = crypto::rsa_oaep_sha1_encrypt(modulus, &SRK_WELL_KNOWN_AUTH)?;

    // The chip terminates the OIAP session together with the command since
    // continueAuthSession stays clear, on success and on failure alike.
    let session = commands.oiap().map_err(FlowError::from)?;

    let result = commands.take_ownership(
        &enc_owner_auth,
        &enc_srk_auth,
        &TpmKey12::srk_params(),
        &session,
        &OWNER_AUTH_HASH,
    );
    match result {
        Ok(srk) => {
            if srk.pub_key.key.is_empty() {
                return Err(FlowError::new(
                    ErrorCode::Fail,
                    "take ownership returned an empty storage root key",
                ));
            }
            Ok(())
        }
        Err(err) => {
            if matches!(
                chip_code(&err),
                Some(tpm12proto::TPM_DEACTIVATED) | Some(tpm12proto::TPM_DISABLED)
            ) {
                return Err(FlowError::new(
                    ErrorCode::Tpm12DisabledDeactivated,
                    "the TPM1.2 is disabled or deactivated",
                ));
            }
            Err(err.into())
        }
    }
}

/// Prepare a 2.0 update: a policy session restricted to the vendor
/// field-upgrade start command, satisfied with the empty platform auth.
/// Returns the live session handle; the update driver owns flushing it.
pub fn prepare_tpm20_policy<T: TpmTransport>(
    commands: &mut TpmCommands<T>,
) -> Result<u32, FlowError> {
    let session = commands.start_policy_session().map_err(FlowError::from)?;

    if let Err(err) = commands.policy_command_code(session, CC_FIELD_UPGRADE_START_VENDOR) {
        flush_session(commands, session);
        return Err(err.into());
    }
    if let Err(err) = commands.policy_secret(session) {
        flush_session(commands, session);
        return Err(err.into());
    }

    Ok(session)
}

/// Best-effort flush of a 2.0 session; a flush failure is logged, never
/// surfaced over the error that led here.
pub fn flush_session<T: TpmTransport>(commands: &mut TpmCommands<T>, session: u32) {
    if let Err(err) = commands.flush_context(session) {
        tracing::warn!(
            error = &err as &dyn std::error::Error,
            session,
            "failed to flush the policy session"
        );
    }
}

/// Remove the TPM1.2 owner that an earlier 1.2-to-1.2 update installed.
pub fn clear_tpm12_ownership<T: TpmTransport>(
    commands: &mut TpmCommands<T>,
    state: &TpmState,
) -> Result<(), FlowError> {
    if state.is_12 && state.is_12_owned {
        // Continue below.
    } else if state.is_20 {
        return Err(FlowError::new(
            ErrorCode::NotSupportedFeature,
            "the detected TPM is a TPM2.0",
        ));
    } else if state.is_12 {
        return Err(FlowError::new(
            ErrorCode::Tpm12NoOwner,
            "the detected TPM1.2 has no owner",
        ));
    } else if !state.is_infineon {
        return Err(FlowError::new(
            ErrorCode::NoIfxTpm,
            "the detected TPM is not an Infineon TPM",
        ));
    } else {
        return Err(FlowError::new(
            ErrorCode::UnsupportedChip,
            "the detected TPM is not in a supported mode",
        ));
    }

    // Owner-authorized clear through an OSAP session keyed with the default
    // owner authorization.
    let nonce_odd_osap = crypto::random_nonce()?;
    let osap = commands
        .osap(tpm12proto::TPM_ET_OWNER, 0, nonce_odd_osap)
        .map_err(FlowError::from)?;

    match commands.owner_clear(&osap, &nonce_odd_osap, &OWNER_AUTH_HASH) {
        Ok(()) => Ok(()),
        Err(err) => {
            if chip_code(&err) == Some(tpm12proto::TPM_AUTHFAIL) {
                return Err(FlowError::new(
                    ErrorCode::Tpm12InvalidOwnerAuth,
                    "the owner authorization is not the expected default value",
                ));
            }
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Writer;
    use crate::test_support::*;
    use crate::tpm12proto::TpmPubkey;
    use crate::tpm20proto::CommandCodeEnum;

    fn pubek_body() -> Vec<u8> {
        let pubkey = TpmPubkey {
            algorithm_parms: crate::tpm12proto::TpmKeyParms {
                algorithm_id: tpm12proto::TPM_ALG_RSA,
                enc_scheme: tpm12proto::TPM_ES_RSAESOAEP_SHA1_MGF1,
                sig_scheme: tpm12proto::TPM_SS_NONE,
                parms: crate::tpm12proto::TpmRsaKeyParms {
                    key_length: 2048,
                    num_primes: 2,
                    exponent: Vec::new(),
                },
            },
            pub_key: crate::tpm12proto::TpmStorePubkey {
                key: {
                    let mut modulus = vec![0xf1u8; 256];
                    modulus[255] = 0xfd;
                    modulus
                },
            },
        };
        let mut buf = [0u8; 512];
        let mut writer = Writer::new(&mut buf);
        pubkey.marshal(&mut writer).unwrap();
        let len = writer.len();
        let mut body = buf[..len].to_vec();
        // Trailing checksum digest.
        body.extend_from_slice(&[0u8; 20]);
        body
    }

    fn oiap_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0200_0001u32.to_be_bytes());
        body.extend_from_slice(&[0x7e; 20]);
        body
    }

    fn srk_body() -> Vec<u8> {
        let srk = TpmKey12 {
            pub_key: crate::tpm12proto::TpmStorePubkey {
                key: vec![0x11; 256],
            },
            ..TpmKey12::srk_params()
        };
        let mut buf = [0u8; 512];
        let mut writer = Writer::new(&mut buf);
        srk.marshal(&mut writer).unwrap();
        let len = writer.len();
        buf[..len].to_vec()
    }

    #[test]
    fn physical_presence_enable_bad_parameter_is_tolerated() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![
            reply_12(tpm12proto::TPM_BAD_PARAMETER, &[]),
            reply_12(0, &[]),
            reply_12(0, &[]),
        ]));
        prepare_tpm12_physical_presence(&mut commands).unwrap();
        assert_eq!(commands.transport_mut().commands.len(), 3);
    }

    #[test]
    fn physical_presence_locked_maps_to_deferred_pp_required() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![
            reply_12(0, &[]),
            reply_12(tpm12proto::TPM_BAD_PARAMETER, &[]),
        ]));
        let err = prepare_tpm12_physical_presence(&mut commands).unwrap_err();
        assert!(err.is(ErrorCode::Tpm12DeferredPpRequired));
    }

    #[test]
    fn set_capability_failure_is_fatal() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![
            reply_12(0, &[]),
            reply_12(0, &[]),
            reply_12(tpm12proto::TPM_FAIL, &[]),
        ]));
        let err = prepare_tpm12_physical_presence(&mut commands).unwrap_err();
        assert_eq!(err.chip_code(), Some(tpm12proto::TPM_FAIL));
    }

    #[test]
    fn take_ownership_success() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![
            reply_12(0, &pubek_body()),
            reply_12(0, &oiap_body()),
            reply_12_auth(0, &srk_body()),
        ]));
        prepare_tpm12_ownership(&mut commands).unwrap();
    }

    #[test]
    fn take_ownership_on_disabled_chip() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![
            reply_12(0, &pubek_body()),
            reply_12(0, &oiap_body()),
            reply_12(tpm12proto::TPM_DISABLED, &[]),
        ]));
        let err = prepare_tpm12_ownership(&mut commands).unwrap_err();
        assert!(err.is(ErrorCode::Tpm12DisabledDeactivated));
    }

    #[test]
    fn policy_session_prepared() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![
            start_session_reply(0x0300_0000),
            reply_20(0x8001, 0, &[]),
            reply_20(0x8002, 0, &[]),
        ]));
        let session = prepare_tpm20_policy(&mut commands).unwrap();
        assert_eq!(session, 0x0300_0000);
        assert_eq!(
            commands.transport_mut().sent_codes(),
            vec![
                CommandCodeEnum::StartAuthSession as u32,
                CommandCodeEnum::PolicyCommandCode as u32,
                CommandCodeEnum::PolicySecret as u32,
            ]
        );
    }

    #[test]
    fn policy_failure_flushes_session() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![
            start_session_reply(0x0300_0000),
            reply_20(0x8001, 0x0143, &[]),
            reply_20(0x8001, 0, &[]), // FlushContext
        ]));
        let err = prepare_tpm20_policy(&mut commands).unwrap_err();
        assert_eq!(err.chip_code(), Some(0x0143));
        let codes = commands.transport_mut().sent_codes();
        assert_eq!(codes.last(), Some(&(CommandCodeEnum::FlushContext as u32)));
    }

    #[test]
    fn clear_ownership_rejects_tpm20() {
        let state = TpmState {
            is_20: true,
            is_infineon: true,
            ..Default::default()
        };
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![]));
        let err = clear_tpm12_ownership(&mut commands, &state).unwrap_err();
        assert!(err.is(ErrorCode::NotSupportedFeature));
        assert!(commands.transport_mut().commands.is_empty());
    }

    #[test]
    fn clear_ownership_requires_owner() {
        let state = TpmState {
            is_12: true,
            is_infineon: true,
            ..Default::default()
        };
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![]));
        let err = clear_tpm12_ownership(&mut commands, &state).unwrap_err();
        assert!(err.is(ErrorCode::Tpm12NoOwner));
    }

    #[test]
    fn clear_ownership_wrong_owner_auth() {
        let state = TpmState {
            is_12: true,
            is_12_owned: true,
            is_infineon: true,
            ..Default::default()
        };
        let mut osap_body = Vec::new();
        osap_body.extend_from_slice(&0x0200_0002u32.to_be_bytes());
        osap_body.extend_from_slice(&[0x01; 20]);
        osap_body.extend_from_slice(&[0x02; 20]);
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![
            reply_12(0, &osap_body),
            reply_12(tpm12proto::TPM_AUTHFAIL, &[]),
        ]));
        let err = clear_tpm12_ownership(&mut commands, &state).unwrap_err();
        assert!(err.is(ErrorCode::Tpm12InvalidOwnerAuth));
    }
}
