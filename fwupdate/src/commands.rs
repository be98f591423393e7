// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! One request/response function per TPM command the update flow drives,
//! on top of the [`TpmTransport`] seam.

use crate::codec::CodecError;
use crate::codec::Reader;
use crate::codec::Writer;
use crate::crypto;
use crate::crypto::CryptoError;
use crate::fieldupgrade;
use crate::fieldupgrade::FieldUpgradeInfo;
use crate::tpm12proto;
use crate::tpm12proto::AuthSession12;
use crate::tpm12proto::AuthTrailer;
use crate::tpm12proto::Authdata;
use crate::tpm12proto::Nonce;
use crate::tpm12proto::OsapSession;
use crate::tpm12proto::ReplyHeader12;
use crate::tpm12proto::TpmKey12;
use crate::tpm12proto::TpmPubkey;
use crate::tpm20proto;
use crate::tpm20proto::protocol::CapabilityData;
use crate::tpm20proto::protocol::FieldUpgradeDataVendorCmd;
use crate::tpm20proto::protocol::FieldUpgradeFinalizeVendorCmd;
use crate::tpm20proto::protocol::FieldUpgradeStartVendorCmd;
use crate::tpm20proto::protocol::FlushContextCmd;
use crate::tpm20proto::protocol::GetCapabilityCmd;
use crate::tpm20proto::protocol::GetTestResultCmd;
use crate::tpm20proto::protocol::PolicyCommandCodeCmd;
use crate::tpm20proto::protocol::PolicySecretCmd;
use crate::tpm20proto::protocol::StartAuthSessionCmd;
use crate::tpm20proto::protocol::StartupCmd;
use crate::tpm20proto::protocol::StartupType;
use crate::tpm20proto::protocol::TpmCommand;
use crate::tpm20proto::AlgIdEnum;
use crate::tpm20proto::CommandCode;
use crate::tpm20proto::ResponseValidationError;
use crate::tpm20proto::SessionTagEnum;
use crate::tpm20proto::TPM_SE_POLICY;
use crate::tpm_device::TpmIoError;
use crate::tpm_device::TpmTransport;
use std::time::Duration;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

// Per-command wait bounds from the vendor timing classes: capability and
// session commands finish quickly, authorization changes take longer, and
// field-upgrade commands may block while the chip erases flash.
const DURATION_SHORT: Duration = Duration::from_millis(2_000);
const DURATION_MEDIUM: Duration = Duration::from_millis(20_000);
const DURATION_LONG: Duration = Duration::from_millis(120_000);

#[derive(Error, Debug)]
pub enum TpmCommandError {
    #[error("failed to transmit the TPM command")]
    Transmit(#[source] TpmIoError),
    #[error("invalid response from the TPM command")]
    InvalidResponse(#[source] ResponseValidationError),
    #[error("malformed response from the TPM command")]
    MalformedResponse(#[source] CodecError),
    #[error("failed to marshal the TPM command")]
    Marshal(#[source] CodecError),
    #[error("invalid input parameter for the TPM command")]
    InvalidInputParameter(#[source] tpm20proto::InvalidInput),
    #[error("TPM command failed, response code: {response_code:#x}")]
    TpmCommandFailed { response_code: u32 },
    #[error("authorization computation failed")]
    Auth(#[source] CryptoError),
}

impl TpmCommandError {
    /// The raw chip response code, if the chip itself rejected the command.
    pub fn chip_code(&self) -> Option<u32> {
        match self {
            TpmCommandError::TpmCommandFailed { response_code } => Some(*response_code),
            _ => None,
        }
    }
}

/// The command layer: owns the transport and issues one command at a time.
pub struct TpmCommands<T> {
    transport: T,
}

impl<T: TpmTransport> TpmCommands<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    // === TPM 2.0 commands === //

    fn execute_20<C: TpmCommand>(
        &mut self,
        command: &[u8],
        session_tag: SessionTagEnum,
        max_duration: Duration,
    ) -> Result<C::Reply, TpmCommandError> {
        let response = self
            .transport
            .transmit(command, max_duration)
            .map_err(TpmCommandError::Transmit)?;

        match C::base_validate_reply(&response, session_tag) {
            Err(error) => Err(TpmCommandError::InvalidResponse(error))?,
            Ok((res, false)) => {
                let header = tpm20proto::protocol::common::ReplyHeader::ref_from_prefix(
                    res.as_bytes(),
                )
                .expect("validated reply starts with a header")
                .0;
                Err(TpmCommandError::TpmCommandFailed {
                    response_code: header.response_code.get(),
                })?
            }
            Ok((res, true)) => Ok(res),
        }
    }

    pub fn startup(&mut self, startup_type: StartupType) -> Result<(), TpmCommandError> {
        let session_tag = SessionTagEnum::NoSessions;
        let cmd = StartupCmd::new(session_tag.into(), startup_type);
        self.execute_20::<StartupCmd>(cmd.as_bytes(), session_tag, DURATION_SHORT)?;
        Ok(())
    }

    pub fn shutdown(&mut self, state: bool) -> Result<(), TpmCommandError> {
        let session_tag = SessionTagEnum::NoSessions;
        let cmd = tpm20proto::protocol::ShutdownCmd::new(session_tag.into(), state);
        self.execute_20::<tpm20proto::protocol::ShutdownCmd>(
            cmd.as_bytes(),
            session_tag,
            DURATION_SHORT,
        )?;
        Ok(())
    }

    pub fn get_capability(
        &mut self,
        capability: u32,
        property: u32,
        property_count: u32,
    ) -> Result<CapabilityData, TpmCommandError> {
        let session_tag = SessionTagEnum::NoSessions;
        let cmd = GetCapabilityCmd::new(session_tag.into(), capability, property, property_count);
        let reply =
            self.execute_20::<GetCapabilityCmd>(cmd.as_bytes(), session_tag, DURATION_SHORT)?;
        Ok(reply.capability_data)
    }

    /// Returns the raw test result code; non-zero means the chip failed its
    /// self test and is in failure mode.
    pub fn get_test_result(&mut self) -> Result<u32, TpmCommandError> {
        let session_tag = SessionTagEnum::NoSessions;
        let cmd = GetTestResultCmd::new(session_tag.into());
        let reply =
            self.execute_20::<GetTestResultCmd>(cmd.as_bytes(), session_tag, DURATION_SHORT)?;
        Ok(reply.test_result.get())
    }

    /// Start an unbound, unsalted SHA-256 policy session. Returns the live
    /// session handle; the caller owns flushing it.
    pub fn start_policy_session(&mut self) -> Result<u32, TpmCommandError> {
        let session_tag = SessionTagEnum::NoSessions;
        let nonce = crypto::random_nonce().map_err(TpmCommandError::Auth)?;
        let cmd = StartAuthSessionCmd::new(
            session_tag.into(),
            &nonce[..16],
            TPM_SE_POLICY,
            AlgIdEnum::SHA256.into(),
        )
        .map_err(TpmCommandError::InvalidInputParameter)?;
        let reply =
            self.execute_20::<StartAuthSessionCmd>(&cmd.serialize(), session_tag, DURATION_SHORT)?;
        Ok(reply.session_handle.get())
    }

    pub fn policy_command_code(
        &mut self,
        policy_session: u32,
        code: CommandCode,
    ) -> Result<(), TpmCommandError> {
        let session_tag = SessionTagEnum::NoSessions;
        let cmd = PolicyCommandCodeCmd::new(session_tag.into(), policy_session, code);
        self.execute_20::<PolicyCommandCodeCmd>(cmd.as_bytes(), session_tag, DURATION_SHORT)?;
        Ok(())
    }

    pub fn policy_secret(&mut self, policy_session: u32) -> Result<(), TpmCommandError> {
        let session_tag = SessionTagEnum::Sessions;
        let cmd = PolicySecretCmd::new(session_tag.into(), policy_session);
        self.execute_20::<PolicySecretCmd>(&cmd.serialize(), session_tag, DURATION_SHORT)?;
        Ok(())
    }

    pub fn hierarchy_change_auth(&mut self, new_auth: &[u8]) -> Result<(), TpmCommandError> {
        let session_tag = SessionTagEnum::Sessions;
        let cmd = tpm20proto::protocol::HierarchyChangeAuthCmd::new(
            session_tag.into(),
            tpm20proto::TPM20_RH_PLATFORM,
            tpm20proto::protocol::common::CmdAuth::new(tpm20proto::TPM20_RS_PW, 0, 0, 0),
            new_auth,
        )
        .map_err(TpmCommandError::InvalidInputParameter)?;
        self.execute_20::<tpm20proto::protocol::HierarchyChangeAuthCmd>(
            &cmd.serialize(),
            session_tag,
            DURATION_MEDIUM,
        )?;
        Ok(())
    }

    pub fn flush_context(&mut self, handle: u32) -> Result<(), TpmCommandError> {
        let session_tag = SessionTagEnum::NoSessions;
        let cmd = FlushContextCmd::new(handle);
        self.execute_20::<FlushContextCmd>(cmd.as_bytes(), session_tag, DURATION_SHORT)?;
        Ok(())
    }

    pub fn field_upgrade_start_20(
        &mut self,
        policy_session: u32,
        manifest: &[u8],
    ) -> Result<(), TpmCommandError> {
        let session_tag = SessionTagEnum::Sessions;
        let cmd = FieldUpgradeStartVendorCmd::new(session_tag.into(), policy_session, manifest)
            .map_err(TpmCommandError::InvalidInputParameter)?;
        self.execute_20::<FieldUpgradeStartVendorCmd>(
            &cmd.serialize(),
            session_tag,
            DURATION_LONG,
        )?;
        Ok(())
    }

    pub fn field_upgrade_data_20(&mut self, block: &[u8]) -> Result<(), TpmCommandError> {
        let session_tag = SessionTagEnum::NoSessions;
        let cmd = FieldUpgradeDataVendorCmd::new(session_tag.into(), block)
            .map_err(TpmCommandError::InvalidInputParameter)?;
        self.execute_20::<FieldUpgradeDataVendorCmd>(&cmd.serialize(), session_tag, DURATION_LONG)?;
        Ok(())
    }

    pub fn field_upgrade_finalize_20(&mut self) -> Result<(), TpmCommandError> {
        let session_tag = SessionTagEnum::NoSessions;
        let cmd = FieldUpgradeFinalizeVendorCmd::new(session_tag.into());
        self.execute_20::<FieldUpgradeFinalizeVendorCmd>(
            cmd.as_bytes(),
            session_tag,
            DURATION_LONG,
        )?;
        Ok(())
    }

    // === TPM 1.2 commands === //

    /// Marshal a 1.2 command, transmit it, and return the reply body after
    /// the validated header.
    fn execute_12(
        &mut self,
        tag: u16,
        ordinal: u32,
        params: &[u8],
        auth: Option<&AuthTrailer>,
        max_duration: Duration,
    ) -> Result<Vec<u8>, TpmCommandError> {
        let mut buf = [0u8; tpm12proto::MAX_COMMAND_SIZE];
        let mut writer = Writer::new(&mut buf);
        let size = tpm12proto::marshal_header(&mut writer, tag, ordinal)
            .map_err(TpmCommandError::Marshal)?;
        writer.write_bytes(params).map_err(TpmCommandError::Marshal)?;
        if let Some(auth) = auth {
            auth.marshal(&mut writer).map_err(TpmCommandError::Marshal)?;
        }
        let total = writer.len();
        writer.patch_u32(size, total as u32);

        let response = self
            .transport
            .transmit(&buf[..total], max_duration)
            .map_err(TpmCommandError::Transmit)?;

        let mut reader = Reader::new(&response);
        let header =
            ReplyHeader12::unmarshal(&mut reader).map_err(TpmCommandError::MalformedResponse)?;
        if header.result != tpm12proto::TPM_SUCCESS {
            return Err(TpmCommandError::TpmCommandFailed {
                response_code: header.result,
            });
        }
        if header.size as usize != response.len() {
            return Err(TpmCommandError::MalformedResponse(
                CodecError::InsufficientBuffer {
                    needed: header.size as usize,
                    remaining: response.len(),
                },
            ));
        }
        Ok(response[reader.consumed()..].to_vec())
    }

    /// Authorization value for a 1.2 AUTH1 command: HMAC over the parameter
    /// digest and session nonces.
    fn auth1(
        &self,
        ordinal: u32,
        params: &[u8],
        session: &AuthSession12,
        nonce_odd: Nonce,
        continue_auth_session: bool,
        key: &Authdata,
    ) -> Result<AuthTrailer, TpmCommandError> {
        let mut digest_input = Vec::with_capacity(4 + params.len());
        digest_input.extend_from_slice(&ordinal.to_be_bytes());
        digest_input.extend_from_slice(params);
        let param_digest = crypto::sha1(&digest_input).map_err(TpmCommandError::Auth)?;

        let mut auth_input = Vec::with_capacity(61);
        auth_input.extend_from_slice(&param_digest);
        auth_input.extend_from_slice(&session.nonce_even);
        auth_input.extend_from_slice(&nonce_odd);
        auth_input.push(continue_auth_session as u8);
        let auth = crypto::hmac_sha1(key, &auth_input).map_err(TpmCommandError::Auth)?;

        Ok(AuthTrailer {
            auth_handle: session.handle,
            nonce_odd,
            continue_auth_session,
            auth,
        })
    }

    pub fn oiap(&mut self) -> Result<AuthSession12, TpmCommandError> {
        let body = self.execute_12(
            tpm12proto::TPM_TAG_RQU_COMMAND,
            tpm12proto::TPM_ORD_OIAP,
            &[],
            None,
            DURATION_SHORT,
        )?;
        let mut reader = Reader::new(&body);
        let handle = reader.read_u32().map_err(TpmCommandError::MalformedResponse)?;
        let nonce_even = reader
            .read_array::<{ tpm12proto::SHA1_DIGEST_SIZE }>()
            .map_err(TpmCommandError::MalformedResponse)?;
        Ok(AuthSession12 { handle, nonce_even })
    }

    pub fn osap(
        &mut self,
        entity_type: u16,
        entity_value: u32,
        nonce_odd_osap: Nonce,
    ) -> Result<OsapSession, TpmCommandError> {
        let mut params = [0u8; 26];
        let mut writer = Writer::new(&mut params);
        writer.write_u16(entity_type).map_err(TpmCommandError::Marshal)?;
        writer.write_u32(entity_value).map_err(TpmCommandError::Marshal)?;
        writer
            .write_bytes(&nonce_odd_osap)
            .map_err(TpmCommandError::Marshal)?;

        let body = self.execute_12(
            tpm12proto::TPM_TAG_RQU_COMMAND,
            tpm12proto::TPM_ORD_OSAP,
            &params,
            None,
            DURATION_SHORT,
        )?;
        let mut reader = Reader::new(&body);
        let handle = reader.read_u32().map_err(TpmCommandError::MalformedResponse)?;
        let nonce_even = reader
            .read_array::<{ tpm12proto::SHA1_DIGEST_SIZE }>()
            .map_err(TpmCommandError::MalformedResponse)?;
        let nonce_even_osap = reader
            .read_array::<{ tpm12proto::SHA1_DIGEST_SIZE }>()
            .map_err(TpmCommandError::MalformedResponse)?;
        Ok(OsapSession {
            session: AuthSession12 { handle, nonce_even },
            nonce_even_osap,
        })
    }

    pub fn tsc_physical_presence(&mut self, presence: u16) -> Result<(), TpmCommandError> {
        self.execute_12(
            tpm12proto::TPM_TAG_RQU_COMMAND,
            tpm12proto::TSC_ORD_PHYSICAL_PRESENCE,
            &presence.to_be_bytes(),
            None,
            DURATION_SHORT,
        )?;
        Ok(())
    }

    pub fn set_capability(
        &mut self,
        cap_area: u32,
        sub_cap: u32,
        value: &[u8],
    ) -> Result<(), TpmCommandError> {
        let mut buf = [0u8; 64];
        let mut writer = Writer::new(&mut buf);
        writer.write_u32(cap_area).map_err(TpmCommandError::Marshal)?;
        writer.write_u32(4).map_err(TpmCommandError::Marshal)?;
        writer.write_u32(sub_cap).map_err(TpmCommandError::Marshal)?;
        writer
            .write_u32(value.len() as u32)
            .map_err(TpmCommandError::Marshal)?;
        writer.write_bytes(value).map_err(TpmCommandError::Marshal)?;
        let len = writer.len();

        self.execute_12(
            tpm12proto::TPM_TAG_RQU_COMMAND,
            tpm12proto::TPM_ORD_SET_CAPABILITY,
            &buf[..len],
            None,
            DURATION_SHORT,
        )?;
        Ok(())
    }

    pub fn read_pubek(&mut self) -> Result<TpmPubkey, TpmCommandError> {
        let anti_replay = crypto::random_nonce().map_err(TpmCommandError::Auth)?;
        let body = self.execute_12(
            tpm12proto::TPM_TAG_RQU_COMMAND,
            tpm12proto::TPM_ORD_READ_PUBEK,
            &anti_replay,
            None,
            DURATION_SHORT,
        )?;
        let mut reader = Reader::new(&body);
        let pubkey = TpmPubkey::unmarshal(&mut reader).map_err(TpmCommandError::MalformedResponse)?;
        // The trailing checksum digest is not verified; the EK is only used
        // to encrypt fresh secrets.
        Ok(pubkey)
    }

    pub fn take_ownership(
        &mut self,
        enc_owner_auth: &[u8],
        enc_srk_auth: &[u8],
        srk_params: &TpmKey12,
        session: &AuthSession12,
        owner_auth: &Authdata,
    ) -> Result<TpmKey12, TpmCommandError> {
        let mut buf = [0u8; tpm12proto::MAX_COMMAND_SIZE];
        let mut writer = Writer::new(&mut buf);
        writer
            .write_u16(tpm12proto::TPM_PID_OWNER)
            .map_err(TpmCommandError::Marshal)?;
        writer
            .write_u32(enc_owner_auth.len() as u32)
            .map_err(TpmCommandError::Marshal)?;
        writer
            .write_bytes(enc_owner_auth)
            .map_err(TpmCommandError::Marshal)?;
        writer
            .write_u32(enc_srk_auth.len() as u32)
            .map_err(TpmCommandError::Marshal)?;
        writer
            .write_bytes(enc_srk_auth)
            .map_err(TpmCommandError::Marshal)?;
        srk_params.marshal(&mut writer).map_err(TpmCommandError::Marshal)?;
        let len = writer.len();

        let nonce_odd = crypto::random_nonce().map_err(TpmCommandError::Auth)?;
        let auth = self.auth1(
            tpm12proto::TPM_ORD_TAKE_OWNERSHIP,
            &buf[..len],
            session,
            nonce_odd,
            false,
            owner_auth,
        )?;

        let body = self.execute_12(
            tpm12proto::TPM_TAG_RQU_AUTH1_COMMAND,
            tpm12proto::TPM_ORD_TAKE_OWNERSHIP,
            &buf[..len],
            Some(&auth),
            DURATION_LONG,
        )?;
        let mut reader = Reader::new(&body);
        let srk = TpmKey12::unmarshal(&mut reader).map_err(TpmCommandError::MalformedResponse)?;
        Ok(srk)
    }

    /// Owner-authorized clear through an OSAP session; the HMAC key is the
    /// OSAP shared secret.
    pub fn owner_clear(
        &mut self,
        osap: &OsapSession,
        nonce_odd_osap: &Nonce,
        owner_auth: &Authdata,
    ) -> Result<(), TpmCommandError> {
        let mut secret_input = Vec::with_capacity(40);
        secret_input.extend_from_slice(&osap.nonce_even_osap);
        secret_input.extend_from_slice(nonce_odd_osap);
        let shared_secret =
            crypto::hmac_sha1(owner_auth, &secret_input).map_err(TpmCommandError::Auth)?;

        let nonce_odd = crypto::random_nonce().map_err(TpmCommandError::Auth)?;
        let auth = self.auth1(
            tpm12proto::TPM_ORD_OWNER_CLEAR,
            &[],
            &osap.session,
            nonce_odd,
            false,
            &shared_secret,
        )?;

        self.execute_12(
            tpm12proto::TPM_TAG_RQU_AUTH1_COMMAND,
            tpm12proto::TPM_ORD_OWNER_CLEAR,
            &[],
            Some(&auth),
            DURATION_MEDIUM,
        )?;
        Ok(())
    }

    pub fn field_upgrade_info_request(&mut self) -> Result<FieldUpgradeInfo, TpmCommandError> {
        let body = self.execute_12(
            tpm12proto::TPM_TAG_RQU_COMMAND,
            tpm12proto::TPM_ORD_FIELD_UPGRADE,
            &[fieldupgrade::SUBCMD_INFO_REQUEST],
            None,
            DURATION_SHORT,
        )?;
        let mut reader = Reader::new(&body);
        FieldUpgradeInfo::unmarshal(&mut reader).map_err(TpmCommandError::MalformedResponse)
    }

    fn field_upgrade_12(
        &mut self,
        subcmd: u8,
        payload: &[u8],
        max_duration: Duration,
    ) -> Result<(), TpmCommandError> {
        let mut buf = [0u8; tpm12proto::MAX_COMMAND_SIZE];
        let mut writer = Writer::new(&mut buf);
        writer.write_u8(subcmd).map_err(TpmCommandError::Marshal)?;
        writer
            .write_sized_blob(payload)
            .map_err(TpmCommandError::Marshal)?;
        let len = writer.len();

        self.execute_12(
            tpm12proto::TPM_TAG_RQU_COMMAND,
            tpm12proto::TPM_ORD_FIELD_UPGRADE,
            &buf[..len],
            None,
            max_duration,
        )?;
        Ok(())
    }

    pub fn field_upgrade_start_12(&mut self, manifest: &[u8]) -> Result<(), TpmCommandError> {
        self.field_upgrade_12(fieldupgrade::SUBCMD_START, manifest, DURATION_LONG)
    }

    pub fn field_upgrade_update_12(&mut self, block: &[u8]) -> Result<(), TpmCommandError> {
        self.field_upgrade_12(fieldupgrade::SUBCMD_UPDATE, block, DURATION_LONG)
    }

    pub fn field_upgrade_complete_12(&mut self) -> Result<(), TpmCommandError> {
        self.field_upgrade_12(fieldupgrade::SUBCMD_COMPLETE, &[], DURATION_LONG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::reply_12;
    use crate::test_support::reply_12_auth;
    use crate::test_support::reply_20;
    use crate::test_support::ScriptedTransport;

    #[test]
    fn oiap_round_trip() {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0200_0001u32.to_be_bytes());
        body.extend_from_slice(&[0x7e; 20]);
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![reply_12(0, &body)]));

        let session = commands.oiap().unwrap();
        assert_eq!(session.handle, 0x0200_0001);
        assert_eq!(session.nonce_even, [0x7e; 20]);

        let sent = &commands.transport.commands[0];
        assert_eq!(
            sent,
            &[0x00, 0xc1, 0x00, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x0a]
        );
    }

    #[test]
    fn physical_presence_chip_error_is_surfaced() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![reply_12(
            tpm12proto::TPM_BAD_PARAMETER,
            &[],
        )]));

        let err = commands
            .tsc_physical_presence(tpm12proto::TPM_PHYSICAL_PRESENCE_CMD_ENABLE)
            .unwrap_err();
        assert_eq!(err.chip_code(), Some(tpm12proto::TPM_BAD_PARAMETER));
    }

    #[test]
    fn set_capability_wire_format() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![reply_12(0, &[])]));
        commands
            .set_capability(
                tpm12proto::TPM_SET_STCLEAR_DATA,
                tpm12proto::TPM_SD_DEFERREDPHYSICALPRESENCE,
                &[0x00, 0x00, 0x00, 0x01],
            )
            .unwrap();

        let sent = &commands.transport.commands[0];
        // header
        assert_eq!(&sent[..2], &[0x00, 0xc1]);
        assert_eq!(&sent[6..10], &tpm12proto::TPM_ORD_SET_CAPABILITY.to_be_bytes());
        // capArea, subCapSize, subCap, valueSize, value
        assert_eq!(&sent[10..14], &4u32.to_be_bytes());
        assert_eq!(&sent[14..18], &4u32.to_be_bytes());
        assert_eq!(&sent[18..22], &6u32.to_be_bytes());
        assert_eq!(&sent[22..26], &4u32.to_be_bytes());
        assert_eq!(&sent[26..30], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(sent.len() as u32, u32::from_be_bytes(sent[2..6].try_into().unwrap()));
    }

    #[test]
    fn reply_size_mismatch_is_malformed() {
        // Header claims 16 bytes but only 12 arrive.
        let mut reply = reply_12(0, &[0x00, 0x01]);
        reply[5] = 16;
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![reply]));
        assert!(matches!(
            commands.oiap().unwrap_err(),
            TpmCommandError::MalformedResponse(_)
        ));
    }

    #[test]
    fn command_at_exact_buffer_capacity() {
        // Header (10) + subcommand (1) + blob length (2) + payload.
        let block = vec![0u8; tpm12proto::MAX_COMMAND_SIZE - 13];
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![reply_12(0, &[])]));
        commands.field_upgrade_update_12(&block).unwrap();
        assert_eq!(
            commands.transport.commands[0].len(),
            tpm12proto::MAX_COMMAND_SIZE
        );

        let block = vec![0u8; tpm12proto::MAX_COMMAND_SIZE - 12];
        let err = commands.field_upgrade_update_12(&block).unwrap_err();
        assert!(matches!(
            err,
            TpmCommandError::Marshal(CodecError::InsufficientBuffer { .. })
        ));
    }

    #[test]
    fn tpm20_fixed_commands_wire_codes() {
        let mut commands = TpmCommands::new(ScriptedTransport::new(vec![
            reply_20(0x8001, 0, &[]),
            reply_20(0x8001, 0, &[]),
            reply_20(0x8002, 0, &[]),
        ]));
        commands.startup(StartupType::Clear).unwrap();
        commands.shutdown(false).unwrap();
        commands.hierarchy_change_auth(&[]).unwrap();
        assert_eq!(
            commands.transport.sent_codes(),
            vec![0x0144, 0x0145, 0x0129]
        );
    }

    #[test]
    fn take_ownership_sends_auth_trailer() {
        let srk_body = {
            let mut buf = [0u8; 256];
            let mut writer = Writer::new(&mut buf);
            TpmKey12::srk_params().marshal(&mut writer).unwrap();
            let len = writer.len();
            buf[..len].to_vec()
        };
        let mut commands =
            TpmCommands::new(ScriptedTransport::new(vec![reply_12_auth(0, &srk_body)]));

        let session = AuthSession12 {
            handle: 0x0200_0007,
            nonce_even: [0x01; 20],
        };
        let owner_auth = [0x5a; 20];
        commands
            .take_ownership(&[0xaa; 256], &[0xbb; 256], &TpmKey12::srk_params(), &session, &owner_auth)
            .unwrap();

        let sent = &commands.transport.commands[0];
        assert_eq!(&sent[..2], &[0x00, 0xc2]);
        // The auth trailer closes the command: handle + nonceOdd + flag + HMAC.
        let trailer = &sent[sent.len() - 45..];
        assert_eq!(&trailer[..4], &0x0200_0007u32.to_be_bytes());
        assert_eq!(trailer[24], 0);
    }
}
