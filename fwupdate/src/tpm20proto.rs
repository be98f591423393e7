// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 2.0 protocol types, as defined in the spec, restricted to the command
//! set the firmware-update flow drives, plus the vendor field-upgrade
//! commands.

use self::packed_nums::*;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_be = zerocopy::U16<zerocopy::BigEndian>;
    pub type u32_be = zerocopy::U32<zerocopy::BigEndian>;
}

#[derive(Debug, Error)]
pub enum InvalidInput {
    #[error("input data size too large for buffer - input size > upper bound: {0} > {1}")]
    BufferSizeTooLarge(usize, usize),
}

#[derive(Debug, Error)]
pub enum ResponseValidationError {
    #[error("response size is too small to fit into the buffer")]
    ResponseSizeTooSmall,
    #[error("size {size} specified in the response header does not meet the minimal size of command type {expected_size}, command succeeded: {command_succeeded}")]
    HeaderResponseSizeMismatch {
        size: u32,
        expected_size: usize,
        command_succeeded: bool,
    },
    #[error("unexpected session tag {response_session_tag} specified in the response header, expected: {expected_session_tag}, command succeeded: {command_succeeded}")]
    HeaderSessionTagMismatch {
        response_session_tag: u16,
        expected_session_tag: u16,
        command_succeeded: bool,
    },
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq)]
pub struct ReservedHandle(pub u32_be);

impl PartialEq<ReservedHandle> for u32 {
    fn eq(&self, other: &ReservedHandle) -> bool {
        other.0.get() == *self
    }
}

impl ReservedHandle {
    pub const fn new(kind: u8, offset: u32) -> ReservedHandle {
        ReservedHandle(new_u32_be((kind as u32) << 24 | offset))
    }
}

pub const TPM20_HT_PERMANENT: u8 = 0x40;

pub const TPM20_RH_PLATFORM: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x0c);
// `TPM_RS_PW` (not `TPM_RH_PW`)
// See Table 28, Section 7.4, "Trusted Platform Module Library Part 2: Structures", revision 1.38.
pub const TPM20_RS_PW: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x09);
pub const TPM20_RH_NULL: ReservedHandle = ReservedHandle::new(TPM20_HT_PERMANENT, 0x07);

// The suggested minimal size for the buffer in `TPM2B_MAX_BUFFER`.
// See Table 79, Section 10.4.8, "Trusted Platform Module Library Part 2: Structures", revision 1.38.
pub const MAX_DIGEST_BUFFER_SIZE: usize = 1024;

#[repr(transparent)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SessionTag(pub u16_be);

impl PartialEq<SessionTag> for u16 {
    fn eq(&self, other: &SessionTag) -> bool {
        other.0.get() == *self
    }
}

impl SessionTag {
    const fn new(val: u16) -> SessionTag {
        SessionTag(new_u16_be(val))
    }
}

#[derive(Debug, Copy, Clone)]
#[repr(u16)]
pub enum SessionTagEnum {
    // No structure type specified
    Null = 0x8000,

    // A command/response for a command defined in this specification. The
    // command/response has no attached sessions. If a command has an
    // error and the command tag value is either TPM_ST_NO_SESSIONS or
    // TPM_ST_SESSIONS, then this tag value is used for the response code.
    NoSessions = 0x8001,

    // A command/response for a command defined in this specification. The
    // command/response has one or more attached sessions and the sessionOffset
    // field is present.
    Sessions = 0x8002,

    // Structure describing a Field Upgrade Policy
    FuManifest = 0x8029,
}

impl From<SessionTagEnum> for SessionTag {
    fn from(x: SessionTagEnum) -> Self {
        SessionTag::new(x as u16)
    }
}

impl SessionTagEnum {
    pub fn from_u16(val: u16) -> Option<SessionTagEnum> {
        let ret = match val {
            0x8000 => Self::Null,
            0x8001 => Self::NoSessions,
            0x8002 => Self::Sessions,
            0x8029 => Self::FuManifest,
            _ => return None,
        };
        Some(ret)
    }
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq)]
pub struct CommandCode(pub u32_be);

impl PartialEq<CommandCode> for u32 {
    fn eq(&self, other: &CommandCode) -> bool {
        other.0.get() == *self
    }
}

impl CommandCode {
    pub const fn new(val: u32) -> CommandCode {
        CommandCode(new_u32_be(val))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u32)]
pub enum CommandCodeEnum {
    HierarchyChangeAuth = 0x00000129,
    FieldUpgradeStart = 0x0000012f,
    FieldUpgradeData = 0x00000141,
    Startup = 0x00000144,
    Shutdown = 0x00000145,
    PolicySecret = 0x00000151,
    FlushContext = 0x00000165,
    PolicyCommandCode = 0x0000016c,
    StartAuthSession = 0x00000176,
    GetCapability = 0x0000017a,
    GetTestResult = 0x0000017c,
}

impl From<CommandCodeEnum> for CommandCode {
    fn from(x: CommandCodeEnum) -> Self {
        CommandCode::new(x as u32)
    }
}

/// Bit 29 marks a vendor-defined command code.
pub const CC_VENDOR_BIT: u32 = 0x20000000;

// The vendor encodings of the field-upgrade command group. The chip exposes
// these instead of the (optional) spec-defined codes, mirroring the spec
// codes below the vendor bit.
pub const CC_FIELD_UPGRADE_START_VENDOR: CommandCode =
    CommandCode::new(CC_VENDOR_BIT | CommandCodeEnum::FieldUpgradeStart as u32);
pub const CC_FIELD_UPGRADE_DATA_VENDOR: CommandCode =
    CommandCode::new(CC_VENDOR_BIT | CommandCodeEnum::FieldUpgradeData as u32);
pub const CC_FIELD_UPGRADE_FINALIZE_VENDOR: CommandCode =
    CommandCode::new(CC_VENDOR_BIT | 0x142);

const FLAG_FMT1: u32 = 0x0080;
const FLAG_VER1: u32 = 0x0100;
const FLAG_WARN: u32 = 0x0800 + FLAG_VER1;

#[repr(u32)]
pub enum ResponseCode {
    Success = 0x000,
    /// The given handle value is not valid or cannot be used for this
    /// command.
    Value = FLAG_FMT1 + 0x004,
    /// Hierarchy is not enabled or is not correct for the use.
    Hierarchy = FLAG_FMT1 + 0x0005,
    /// The handle is not correct for the use.
    Handle = FLAG_FMT1 + 0x000B,
    /// The authorization HMAC check failed.
    AuthFail = FLAG_FMT1 + 0x000E,
    /// Structure is the wrong size.
    Size = FLAG_FMT1 + 0x0015,
    /// The TPM was unable to unmarshal a value because there were not
    /// enough bytes in the input buffer.
    Insufficient = FLAG_FMT1 + 0x001A,
    /// TPM is in failure mode.
    Failure = FLAG_VER1 + 0x0001,
    /// The command code is not supported.
    CommandCodeUnsupported = FLAG_VER1 + 0x0043,
    /// The TPM has suspended operation on the command. Forward progress was
    /// made and the command may be retried.
    Yielded = FLAG_WARN + 0x008,
    /// TPM is performing self tests.
    Testing = FLAG_WARN + 0x00A,
    /// The TPM was not able to start the command. Retry might work.
    Retry = FLAG_WARN + 0x022,
}

impl ResponseCode {
    pub fn from_u32(val: u32) -> Option<ResponseCode> {
        let ret = match val {
            x if x == ResponseCode::Success as u32 => ResponseCode::Success,
            x if x == ResponseCode::Value as u32 => ResponseCode::Value,
            x if x == ResponseCode::Hierarchy as u32 => ResponseCode::Hierarchy,
            x if x == ResponseCode::Handle as u32 => ResponseCode::Handle,
            x if x == ResponseCode::AuthFail as u32 => ResponseCode::AuthFail,
            x if x == ResponseCode::Size as u32 => ResponseCode::Size,
            x if x == ResponseCode::Insufficient as u32 => ResponseCode::Insufficient,
            x if x == ResponseCode::Failure as u32 => ResponseCode::Failure,
            x if x == ResponseCode::CommandCodeUnsupported as u32 => {
                ResponseCode::CommandCodeUnsupported
            }
            x if x == ResponseCode::Yielded as u32 => ResponseCode::Yielded,
            x if x == ResponseCode::Testing as u32 => ResponseCode::Testing,
            x if x == ResponseCode::Retry as u32 => ResponseCode::Retry,
            _ => return None,
        };
        Some(ret)
    }
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq)]
pub struct AlgId(pub u16_be);

impl PartialEq<AlgId> for u16 {
    fn eq(&self, other: &AlgId) -> bool {
        other.0.get() == *self
    }
}

impl AlgId {
    pub const fn new(val: u16) -> AlgId {
        AlgId(new_u16_be(val))
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug)]
#[repr(u16)]
pub enum AlgIdEnum {
    SHA256 = 0x000b,
    NULL = 0x0010,
}

impl From<AlgIdEnum> for AlgId {
    fn from(x: AlgIdEnum) -> Self {
        AlgId::new(x as u16)
    }
}

// `TPM_SE` session types.
pub const TPM_SE_POLICY: u8 = 0x01;

// `TPM_SU` startup/shutdown arguments.
pub const TPM_SU_CLEAR: u16 = 0x0000;
pub const TPM_SU_STATE: u16 = 0x0001;

// Capability groups.
pub const TPM_CAP_TPM_PROPERTIES: u32 = 0x00000006;
/// Vendor-defined capability group; the chips answer it with the raw
/// field-upgrade info structure.
pub const TPM_CAP_VENDOR_PROPERTY: u32 = 0x00000100;

// `TPM_PT` fixed properties.
pub const TPM_PT_MANUFACTURER: u32 = 0x00000105;
pub const TPM_PT_FIRMWARE_VERSION_1: u32 = 0x0000010b;
pub const TPM_PT_FIRMWARE_VERSION_2: u32 = 0x0000010c;

/// `TPM_PT_MANUFACTURER` value of the target vendor, "IFX\0".
pub const MANUFACTURER_IFX: u32 = 0x49465800;

/// Workaround to allow constructing a zerocopy U32 in a const context.
const fn new_u32_be(val: u32) -> u32_be {
    u32_be::from_bytes(val.to_be_bytes())
}

/// Workaround to allow constructing a zerocopy U16 in a const context.
const fn new_u16_be(val: u16) -> u16_be {
    u16_be::from_bytes(val.to_be_bytes())
}

/// TPM command / response definitions
pub mod protocol {
    use super::*;

    /// Common structs shared between multiple command / response structs
    pub mod common {
        use super::*;

        #[repr(C)]
        #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct CmdHeader {
            pub session_tag: SessionTag,
            pub size: u32_be,
            pub command_code: CommandCode,
        }

        impl CmdHeader {
            /// Construct a header for a fixed-size command
            pub fn new<Cmd: Sized>(
                session_tag: SessionTag,
                command_code: CommandCode,
            ) -> CmdHeader {
                CmdHeader {
                    session_tag,
                    size: (size_of::<Cmd>() as u32).into(),
                    command_code,
                }
            }
        }

        #[repr(C)]
        #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct ReplyHeader {
            pub session_tag: u16_be,
            pub size: u32_be,
            pub response_code: u32_be,
        }

        impl ReplyHeader {
            /// Performs a few command-agnostic validation checks:
            /// - Ensures the size matches the size_of the provided `FullReply` type
            /// - Compares provided session_tag
            ///
            /// Returns Ok(bool) if the validation passes. The bool value indicates whether
            /// the response_code is [`ResponseCode::Success`] or not.
            /// Returns Err(ResponseValidationError) otherwise.
            pub fn base_validation(
                &self,
                session_tag: SessionTag,
                expected_size: u32,
            ) -> Result<bool, ResponseValidationError> {
                // Response code other than Success indicates that the command fails
                // See Section 6.2, "Trusted Platform Module Library Part 3: Commands", revision 1.38.
                let command_succeeded = ResponseCode::from_u32(self.response_code.get())
                    .map(|c| matches!(c, ResponseCode::Success))
                    .unwrap_or(false);

                let (expected_tag, expected_size) = if command_succeeded {
                    (session_tag, expected_size as usize)
                } else {
                    // If the command fails, the expected tag should be NoSessions and the minimal size
                    // of the response should be the size of the header.
                    // See Section 6.1, "Trusted Platform Module Library Part 3: Commands", revision 1.38.
                    (SessionTagEnum::NoSessions.into(), size_of::<Self>())
                };

                if self.session_tag.get() != expected_tag {
                    Err(ResponseValidationError::HeaderSessionTagMismatch {
                        response_session_tag: self.session_tag.get(),
                        expected_session_tag: session_tag.0.get(),
                        command_succeeded,
                    })?
                }

                // Allow the size specified in the header to be equal to or larger than the expected size in case
                // that the expected size does not take the authorization area into account.
                if (self.size.get() as usize) < expected_size {
                    Err(ResponseValidationError::HeaderResponseSizeMismatch {
                        size: self.size.get(),
                        expected_size,
                        command_succeeded,
                    })?
                }

                Ok(command_succeeded)
            }
        }

        #[repr(C)]
        #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct CmdAuth {
            handle: ReservedHandle,
            nonce_2b: u16_be,
            session: u8,
            auth_2b: u16_be,
        }

        impl CmdAuth {
            pub fn new(handle: ReservedHandle, nonce_2b: u16, session: u8, auth_2b: u16) -> Self {
                CmdAuth {
                    handle,
                    nonce_2b: nonce_2b.into(),
                    session,
                    auth_2b: auth_2b.into(),
                }
            }
        }
    }

    use common::CmdHeader;
    use common::ReplyHeader;

    /// Marker trait for a struct that corresponds to a TPM Command
    pub trait TpmCommand: IntoBytes + FromBytes + Sized + Immutable + KnownLayout {
        type Reply: TpmReply;

        fn base_validate_reply(
            reply_buf: &[u8],
            session_tag: impl Into<SessionTag>,
        ) -> Result<(Self::Reply, bool), ResponseValidationError> {
            let res = Self::Reply::deserialize(reply_buf)
                .ok_or(ResponseValidationError::ResponseSizeTooSmall)?;
            let succeeded = res.base_validation(session_tag.into())?;

            Ok((res, succeeded))
        }
    }

    /// Marker trait for a struct that corresponds to a TPM Reply
    pub trait TpmReply: IntoBytes + FromBytes + Sized + Immutable + KnownLayout {
        type Command: TpmCommand;

        fn base_validation(
            &self,
            session_tag: SessionTag,
        ) -> Result<bool, ResponseValidationError> {
            // `Reply::deserialize` guarantees this should not fail
            let header = ReplyHeader::ref_from_prefix(self.as_bytes())
                .expect("unexpected response size")
                .0;
            header.base_validation(session_tag, self.payload_size() as u32)
        }
        fn deserialize(bytes: &[u8]) -> Option<Self>;
        fn payload_size(&self) -> usize;
    }

    /// General type for TPM 2.0 sized buffers.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct Tpm2bBuffer {
        pub size: u16_be,
        // Use value that is large enough as the buffer size so that we
        // only need to define one struct.
        pub buffer: [u8; MAX_DIGEST_BUFFER_SIZE],
    }

    impl Tpm2bBuffer {
        /// Create a `Tpm2bBuffer` from a slice.
        pub fn new(data: &[u8]) -> Result<Self, InvalidInput> {
            let size = data.len();
            if size > MAX_DIGEST_BUFFER_SIZE {
                Err(InvalidInput::BufferSizeTooLarge(
                    size,
                    MAX_DIGEST_BUFFER_SIZE,
                ))?
            }

            let mut buffer = [0u8; MAX_DIGEST_BUFFER_SIZE];
            buffer[..size].copy_from_slice(data);

            Ok(Self {
                size: new_u16_be(size as u16),
                buffer,
            })
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.size.as_bytes());
            buffer.extend_from_slice(&self.buffer[..self.size.get() as usize]);

            buffer
        }

        pub fn deserialize(bytes: &[u8]) -> Option<Self> {
            let mut start = 0;
            let mut end = size_of::<u16_be>();
            if bytes.len() < end {
                return None;
            }

            let size: u16 = u16_be::read_from_bytes(&bytes[start..end]).ok()?.into();
            if size as usize > MAX_DIGEST_BUFFER_SIZE {
                return None;
            }

            start = end;
            end += size as usize;
            if bytes.len() < end {
                return None;
            }
            let mut buffer = [0u8; MAX_DIGEST_BUFFER_SIZE];
            buffer[..size as usize].copy_from_slice(&bytes[start..end]);

            Some(Self {
                size: size.into(),
                buffer,
            })
        }

        pub fn payload_size(&self) -> usize {
            let mut payload_size = 0;

            payload_size += size_of_val(&self.size);
            payload_size += self.size.get() as usize;

            payload_size
        }

        pub fn as_slice(&self) -> &[u8] {
            &self.buffer[..self.size.get() as usize]
        }
    }

    // === Startup === //

    pub enum StartupType {
        Clear,
        State,
    }

    #[repr(C)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct StartupCmd {
        header: CmdHeader,
        startup_type: u16_be,
    }

    impl StartupCmd {
        pub fn new(session_tag: SessionTag, startup_type: StartupType) -> StartupCmd {
            StartupCmd {
                header: CmdHeader::new::<Self>(session_tag, CommandCodeEnum::Startup.into()),
                startup_type: match startup_type {
                    StartupType::Clear => TPM_SU_CLEAR,
                    StartupType::State => TPM_SU_STATE,
                }
                .into(),
            }
        }
    }

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct StartupReply {
        pub header: ReplyHeader,
    }

    impl TpmCommand for StartupCmd {
        type Reply = StartupReply;
    }

    impl TpmReply for StartupReply {
        type Command = StartupCmd;

        fn deserialize(bytes: &[u8]) -> Option<Self> {
            Some(Self::read_from_prefix(bytes).ok()?.0)
        }

        fn payload_size(&self) -> usize {
            size_of::<Self>()
        }
    }

    // === Shutdown === //

    #[repr(C)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct ShutdownCmd {
        header: CmdHeader,
        shutdown_type: u16_be,
    }

    impl ShutdownCmd {
        pub fn new(session_tag: SessionTag, state: bool) -> ShutdownCmd {
            ShutdownCmd {
                header: CmdHeader::new::<Self>(session_tag, CommandCodeEnum::Shutdown.into()),
                shutdown_type: if state { TPM_SU_STATE } else { TPM_SU_CLEAR }.into(),
            }
        }
    }

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct ShutdownReply {
        pub header: ReplyHeader,
    }

    impl TpmCommand for ShutdownCmd {
        type Reply = ShutdownReply;
    }

    impl TpmReply for ShutdownReply {
        type Command = ShutdownCmd;

        fn deserialize(bytes: &[u8]) -> Option<Self> {
            Some(Self::read_from_prefix(bytes).ok()?.0)
        }

        fn payload_size(&self) -> usize {
            size_of::<Self>()
        }
    }

    // === GetCapability === //

    #[repr(C)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct GetCapabilityCmd {
        header: CmdHeader,
        capability: u32_be,
        property: u32_be,
        property_count: u32_be,
    }

    impl GetCapabilityCmd {
        pub fn new(
            session_tag: SessionTag,
            capability: u32,
            property: u32,
            property_count: u32,
        ) -> Self {
            Self {
                header: CmdHeader::new::<Self>(session_tag, CommandCodeEnum::GetCapability.into()),
                capability: capability.into(),
                property: property.into(),
                property_count: property_count.into(),
            }
        }
    }

    /// One `TPMS_TAGGED_PROPERTY` entry of a properties capability reply.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct TaggedProperty {
        pub property: u32_be,
        pub value: u32_be,
    }

    pub const MAX_TAGGED_PROPERTIES: usize = 8;

    /// `TPMS_CAPABILITY_DATA`, restricted to the two groups the flow reads:
    /// tagged TPM properties and the vendor blob.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct CapabilityData {
        pub capability: u32_be,
        pub property_count: u32_be,
        pub properties: [TaggedProperty; MAX_TAGGED_PROPERTIES],
        pub vendor_blob: Tpm2bBuffer,
    }

    impl CapabilityData {
        pub fn property(&self, tag: u32) -> Option<u32> {
            self.properties[..(self.property_count.get() as usize).min(MAX_TAGGED_PROPERTIES)]
                .iter()
                .find(|p| p.property.get() == tag)
                .map(|p| p.value.get())
        }
    }

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct GetCapabilityReply {
        pub header: ReplyHeader,
        pub more_data: u8,
        pub capability_data: CapabilityData,
        payload_size: u32_be,
    }

    impl TpmCommand for GetCapabilityCmd {
        type Reply = GetCapabilityReply;
    }

    impl TpmReply for GetCapabilityReply {
        type Command = GetCapabilityCmd;

        fn deserialize(bytes: &[u8]) -> Option<Self> {
            let mut start = 0;
            let mut end = size_of::<ReplyHeader>();
            if bytes.len() < end {
                return None;
            }
            let header = ReplyHeader::read_from_bytes(&bytes[start..end]).ok()?;
            let mut reply = Self {
                header,
                more_data: 0,
                capability_data: CapabilityData::new_zeroed(),
                payload_size: new_u32_be(end as u32),
            };
            if reply.header.response_code.get() != ResponseCode::Success as u32 {
                return Some(reply);
            }

            start = end;
            end += size_of::<u8>();
            if bytes.len() < end {
                return None;
            }
            reply.more_data = bytes[start];

            start = end;
            end += size_of::<u32_be>();
            if bytes.len() < end {
                return None;
            }
            let capability: u32 = u32_be::read_from_bytes(&bytes[start..end]).ok()?.into();
            reply.capability_data.capability = capability.into();

            match capability {
                TPM_CAP_TPM_PROPERTIES => {
                    start = end;
                    end += size_of::<u32_be>();
                    if bytes.len() < end {
                        return None;
                    }
                    let count: u32 = u32_be::read_from_bytes(&bytes[start..end]).ok()?.into();
                    if count as usize > MAX_TAGGED_PROPERTIES {
                        return None;
                    }
                    reply.capability_data.property_count = count.into();
                    for i in 0..count as usize {
                        start = end;
                        end += size_of::<TaggedProperty>();
                        if bytes.len() < end {
                            return None;
                        }
                        reply.capability_data.properties[i] =
                            TaggedProperty::read_from_bytes(&bytes[start..end]).ok()?;
                    }
                }
                TPM_CAP_VENDOR_PROPERTY => {
                    start = end;
                    reply.capability_data.vendor_blob = Tpm2bBuffer::deserialize(&bytes[start..])?;
                    end += reply.capability_data.vendor_blob.payload_size();
                }
                _ => return None,
            }

            reply.payload_size = new_u32_be(end as u32);
            Some(reply)
        }

        fn payload_size(&self) -> usize {
            self.payload_size.get() as usize
        }
    }

    // === GetTestResult === //

    #[repr(C)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct GetTestResultCmd {
        header: CmdHeader,
    }

    impl GetTestResultCmd {
        pub fn new(session_tag: SessionTag) -> Self {
            Self {
                header: CmdHeader::new::<Self>(session_tag, CommandCodeEnum::GetTestResult.into()),
            }
        }
    }

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct GetTestResultReply {
        pub header: ReplyHeader,
        pub out_data: Tpm2bBuffer,
        pub test_result: u32_be,
    }

    impl TpmCommand for GetTestResultCmd {
        type Reply = GetTestResultReply;
    }

    impl TpmReply for GetTestResultReply {
        type Command = GetTestResultCmd;

        fn deserialize(bytes: &[u8]) -> Option<Self> {
            let mut start = 0;
            let mut end = size_of::<ReplyHeader>();
            if bytes.len() < end {
                return None;
            }
            let header = ReplyHeader::read_from_bytes(&bytes[start..end]).ok()?;
            let mut reply = Self {
                header,
                out_data: Tpm2bBuffer::new_zeroed(),
                test_result: 0.into(),
            };
            if reply.header.response_code.get() != ResponseCode::Success as u32 {
                return Some(reply);
            }

            start = end;
            reply.out_data = Tpm2bBuffer::deserialize(&bytes[start..])?;
            end += reply.out_data.payload_size();

            start = end;
            end += size_of::<u32_be>();
            if bytes.len() < end {
                return None;
            }
            reply.test_result = u32_be::read_from_bytes(&bytes[start..end]).ok()?;

            Some(reply)
        }

        fn payload_size(&self) -> usize {
            size_of::<ReplyHeader>() + self.out_data.payload_size() + size_of::<u32_be>()
        }
    }

    // === StartAuthSession === //

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct StartAuthSessionCmd {
        pub header: CmdHeader,
        tpm_key: ReservedHandle,
        bind: ReservedHandle,
        nonce_caller: Tpm2bBuffer,
        encrypted_salt: Tpm2bBuffer,
        session_type: u8,
        symmetric: AlgId,
        auth_hash: AlgId,
    }

    impl StartAuthSessionCmd {
        /// An unbound, unsalted session; `symmetric` is fixed to NULL.
        pub fn new(
            session_tag: SessionTag,
            nonce_caller: &[u8],
            session_type: u8,
            auth_hash: AlgId,
        ) -> Result<Self, InvalidInput> {
            let mut cmd = Self {
                header: CmdHeader::new::<Self>(
                    session_tag,
                    CommandCodeEnum::StartAuthSession.into(),
                ),
                tpm_key: TPM20_RH_NULL,
                bind: TPM20_RH_NULL,
                nonce_caller: Tpm2bBuffer::new(nonce_caller)?,
                encrypted_salt: Tpm2bBuffer::new(&[])?,
                session_type,
                symmetric: AlgIdEnum::NULL.into(),
                auth_hash,
            };
            cmd.header.size = new_u32_be(cmd.payload_size() as u32);
            Ok(cmd)
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.header.as_bytes());
            buffer.extend_from_slice(self.tpm_key.as_bytes());
            buffer.extend_from_slice(self.bind.as_bytes());
            buffer.extend_from_slice(&self.nonce_caller.serialize());
            buffer.extend_from_slice(&self.encrypted_salt.serialize());
            buffer.extend_from_slice(self.session_type.as_bytes());
            buffer.extend_from_slice(self.symmetric.as_bytes());
            buffer.extend_from_slice(self.auth_hash.as_bytes());

            buffer
        }

        pub fn payload_size(&self) -> usize {
            let mut payload_size = 0;

            payload_size += size_of_val(&self.header);
            payload_size += size_of_val(&self.tpm_key);
            payload_size += size_of_val(&self.bind);
            payload_size += self.nonce_caller.payload_size();
            payload_size += self.encrypted_salt.payload_size();
            payload_size += size_of_val(&self.session_type);
            payload_size += size_of_val(&self.symmetric);
            payload_size += size_of_val(&self.auth_hash);

            payload_size
        }
    }

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct StartAuthSessionReply {
        pub header: ReplyHeader,
        pub session_handle: u32_be,
        pub nonce_tpm: Tpm2bBuffer,
    }

    impl TpmCommand for StartAuthSessionCmd {
        type Reply = StartAuthSessionReply;
    }

    impl TpmReply for StartAuthSessionReply {
        type Command = StartAuthSessionCmd;

        fn deserialize(bytes: &[u8]) -> Option<Self> {
            let mut start = 0;
            let mut end = size_of::<ReplyHeader>();
            if bytes.len() < end {
                return None;
            }
            let header = ReplyHeader::read_from_bytes(&bytes[start..end]).ok()?;
            let mut reply = Self {
                header,
                session_handle: 0.into(),
                nonce_tpm: Tpm2bBuffer::new_zeroed(),
            };
            if reply.header.response_code.get() != ResponseCode::Success as u32 {
                return Some(reply);
            }

            start = end;
            end += size_of::<u32_be>();
            if bytes.len() < end {
                return None;
            }
            reply.session_handle = u32_be::read_from_bytes(&bytes[start..end]).ok()?;

            start = end;
            reply.nonce_tpm = Tpm2bBuffer::deserialize(&bytes[start..])?;

            Some(reply)
        }

        fn payload_size(&self) -> usize {
            size_of::<ReplyHeader>() + size_of::<u32_be>() + self.nonce_tpm.payload_size()
        }
    }

    // === PolicyCommandCode === //

    #[repr(C)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct PolicyCommandCodeCmd {
        header: CmdHeader,
        policy_session: u32_be,
        code: CommandCode,
    }

    impl PolicyCommandCodeCmd {
        pub fn new(session_tag: SessionTag, policy_session: u32, code: CommandCode) -> Self {
            Self {
                header: CmdHeader::new::<Self>(
                    session_tag,
                    CommandCodeEnum::PolicyCommandCode.into(),
                ),
                policy_session: policy_session.into(),
                code,
            }
        }
    }

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct PolicyCommandCodeReply {
        pub header: ReplyHeader,
    }

    impl TpmCommand for PolicyCommandCodeCmd {
        type Reply = PolicyCommandCodeReply;
    }

    impl TpmReply for PolicyCommandCodeReply {
        type Command = PolicyCommandCodeCmd;

        fn deserialize(bytes: &[u8]) -> Option<Self> {
            Some(Self::read_from_prefix(bytes).ok()?.0)
        }

        fn payload_size(&self) -> usize {
            size_of::<Self>()
        }
    }

    // === PolicySecret === //

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct PolicySecretCmd {
        pub header: CmdHeader,
        auth_handle: ReservedHandle,
        policy_session: u32_be,
        // Authorization area
        auth_size: u32_be,
        auth: common::CmdAuth,
        // Parameters
        nonce_tpm: Tpm2bBuffer,
        cp_hash: Tpm2bBuffer,
        policy_ref: Tpm2bBuffer,
        expiration: u32_be,
    }

    impl PolicySecretCmd {
        /// Authorize the policy session with the (empty) platform auth value
        /// via a password authorization.
        pub fn new(session_tag: SessionTag, policy_session: u32) -> Self {
            let mut cmd = Self {
                header: CmdHeader::new::<Self>(session_tag, CommandCodeEnum::PolicySecret.into()),
                auth_handle: TPM20_RH_PLATFORM,
                policy_session: policy_session.into(),
                auth_size: (size_of::<common::CmdAuth>() as u32).into(),
                auth: common::CmdAuth::new(TPM20_RS_PW, 0, 0, 0),
                nonce_tpm: Tpm2bBuffer::new_zeroed(),
                cp_hash: Tpm2bBuffer::new_zeroed(),
                policy_ref: Tpm2bBuffer::new_zeroed(),
                expiration: 0.into(),
            };
            cmd.header.size = new_u32_be(cmd.payload_size() as u32);
            cmd
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.header.as_bytes());
            buffer.extend_from_slice(self.auth_handle.as_bytes());
            buffer.extend_from_slice(self.policy_session.as_bytes());
            buffer.extend_from_slice(self.auth_size.as_bytes());
            buffer.extend_from_slice(self.auth.as_bytes());
            buffer.extend_from_slice(&self.nonce_tpm.serialize());
            buffer.extend_from_slice(&self.cp_hash.serialize());
            buffer.extend_from_slice(&self.policy_ref.serialize());
            buffer.extend_from_slice(self.expiration.as_bytes());

            buffer
        }

        pub fn payload_size(&self) -> usize {
            let mut payload_size = 0;

            payload_size += size_of_val(&self.header);
            payload_size += size_of_val(&self.auth_handle);
            payload_size += size_of_val(&self.policy_session);
            payload_size += size_of_val(&self.auth_size);
            payload_size += size_of_val(&self.auth);
            payload_size += self.nonce_tpm.payload_size();
            payload_size += self.cp_hash.payload_size();
            payload_size += self.policy_ref.payload_size();
            payload_size += size_of_val(&self.expiration);

            payload_size
        }
    }

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct PolicySecretReply {
        pub header: ReplyHeader,
    }

    impl TpmCommand for PolicySecretCmd {
        type Reply = PolicySecretReply;
    }

    impl TpmReply for PolicySecretReply {
        type Command = PolicySecretCmd;

        fn deserialize(bytes: &[u8]) -> Option<Self> {
            Some(Self::read_from_prefix(bytes).ok()?.0)
        }

        fn payload_size(&self) -> usize {
            size_of::<Self>()
        }
    }

    // === HierarchyChangeAuth === //

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct HierarchyChangeAuthCmd {
        pub header: CmdHeader,
        auth_handle: ReservedHandle,
        // Authorization area
        auth_size: u32_be,
        auth: common::CmdAuth,
        // Parameters
        new_auth: Tpm2bBuffer,
    }

    impl HierarchyChangeAuthCmd {
        pub fn new(
            session_tag: SessionTag,
            auth_handle: ReservedHandle,
            auth: common::CmdAuth,
            new_auth: &[u8],
        ) -> Result<Self, InvalidInput> {
            let mut cmd = Self {
                header: CmdHeader::new::<Self>(
                    session_tag,
                    CommandCodeEnum::HierarchyChangeAuth.into(),
                ),
                auth_handle,
                auth_size: (size_of::<common::CmdAuth>() as u32).into(),
                auth,
                new_auth: Tpm2bBuffer::new(new_auth)?,
            };
            cmd.header.size = new_u32_be(cmd.payload_size() as u32);
            Ok(cmd)
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.header.as_bytes());
            buffer.extend_from_slice(self.auth_handle.as_bytes());
            buffer.extend_from_slice(self.auth_size.as_bytes());
            buffer.extend_from_slice(self.auth.as_bytes());
            buffer.extend_from_slice(&self.new_auth.serialize());

            buffer
        }

        pub fn payload_size(&self) -> usize {
            let mut payload_size = 0;

            payload_size += size_of_val(&self.header);
            payload_size += size_of_val(&self.auth_handle);
            payload_size += size_of_val(&self.auth_size);
            payload_size += size_of_val(&self.auth);
            payload_size += self.new_auth.payload_size();

            payload_size
        }
    }

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct HierarchyChangeAuthReply {
        pub header: ReplyHeader,
    }

    impl TpmCommand for HierarchyChangeAuthCmd {
        type Reply = HierarchyChangeAuthReply;
    }

    impl TpmReply for HierarchyChangeAuthReply {
        type Command = HierarchyChangeAuthCmd;

        fn deserialize(bytes: &[u8]) -> Option<Self> {
            Some(Self::read_from_prefix(bytes).ok()?.0)
        }

        fn payload_size(&self) -> usize {
            size_of::<Self>()
        }
    }

    // === FlushContext === //

    #[repr(C)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct FlushContextCmd {
        header: CmdHeader,
        flush_handle: u32_be,
    }

    impl FlushContextCmd {
        pub fn new(flush_handle: u32) -> Self {
            Self {
                header: CmdHeader::new::<Self>(
                    SessionTagEnum::NoSessions.into(),
                    CommandCodeEnum::FlushContext.into(),
                ),
                flush_handle: flush_handle.into(),
            }
        }
    }

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct FlushContextReply {
        pub header: ReplyHeader,
    }

    impl TpmCommand for FlushContextCmd {
        type Reply = FlushContextReply;
    }

    impl TpmReply for FlushContextReply {
        type Command = FlushContextCmd;

        fn deserialize(bytes: &[u8]) -> Option<Self> {
            Some(Self::read_from_prefix(bytes).ok()?.0)
        }

        fn payload_size(&self) -> usize {
            size_of::<Self>()
        }
    }

    // === FieldUpgradeStartVendor === //

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct FieldUpgradeStartVendorCmd {
        pub header: CmdHeader,
        auth_handle: ReservedHandle,
        // Authorization area: the policy session prepared for this command.
        auth_size: u32_be,
        auth: common::CmdAuth,
        // Parameters
        manifest: Tpm2bBuffer,
    }

    impl FieldUpgradeStartVendorCmd {
        pub fn new(
            session_tag: SessionTag,
            policy_session: u32,
            manifest: &[u8],
        ) -> Result<Self, InvalidInput> {
            let mut cmd = Self {
                header: CmdHeader::new::<Self>(session_tag, CC_FIELD_UPGRADE_START_VENDOR),
                auth_handle: TPM20_RH_PLATFORM,
                auth_size: (size_of::<common::CmdAuth>() as u32).into(),
                // continueSession, so the session stays live until the driver
                // flushes it.
                auth: common::CmdAuth::new(ReservedHandle(policy_session.into()), 0, 0x01, 0),
                manifest: Tpm2bBuffer::new(manifest)?,
            };
            cmd.header.size = new_u32_be(cmd.payload_size() as u32);
            Ok(cmd)
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.header.as_bytes());
            buffer.extend_from_slice(self.auth_handle.as_bytes());
            buffer.extend_from_slice(self.auth_size.as_bytes());
            buffer.extend_from_slice(self.auth.as_bytes());
            buffer.extend_from_slice(&self.manifest.serialize());

            buffer
        }

        pub fn payload_size(&self) -> usize {
            let mut payload_size = 0;

            payload_size += size_of_val(&self.header);
            payload_size += size_of_val(&self.auth_handle);
            payload_size += size_of_val(&self.auth_size);
            payload_size += size_of_val(&self.auth);
            payload_size += self.manifest.payload_size();

            payload_size
        }
    }

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct FieldUpgradeStartVendorReply {
        pub header: ReplyHeader,
    }

    impl TpmCommand for FieldUpgradeStartVendorCmd {
        type Reply = FieldUpgradeStartVendorReply;
    }

    impl TpmReply for FieldUpgradeStartVendorReply {
        type Command = FieldUpgradeStartVendorCmd;

        fn deserialize(bytes: &[u8]) -> Option<Self> {
            Some(Self::read_from_prefix(bytes).ok()?.0)
        }

        fn payload_size(&self) -> usize {
            size_of::<Self>()
        }
    }

    // === FieldUpgradeDataVendor === //

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct FieldUpgradeDataVendorCmd {
        pub header: CmdHeader,
        data: Tpm2bBuffer,
    }

    impl FieldUpgradeDataVendorCmd {
        pub fn new(session_tag: SessionTag, data: &[u8]) -> Result<Self, InvalidInput> {
            let mut cmd = Self {
                header: CmdHeader::new::<Self>(session_tag, CC_FIELD_UPGRADE_DATA_VENDOR),
                data: Tpm2bBuffer::new(data)?,
            };
            cmd.header.size = new_u32_be(cmd.payload_size() as u32);
            Ok(cmd)
        }

        pub fn serialize(&self) -> Vec<u8> {
            let mut buffer = Vec::new();

            buffer.extend_from_slice(self.header.as_bytes());
            buffer.extend_from_slice(&self.data.serialize());

            buffer
        }

        pub fn payload_size(&self) -> usize {
            size_of_val(&self.header) + self.data.payload_size()
        }
    }

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct FieldUpgradeDataVendorReply {
        pub header: ReplyHeader,
    }

    impl TpmCommand for FieldUpgradeDataVendorCmd {
        type Reply = FieldUpgradeDataVendorReply;
    }

    impl TpmReply for FieldUpgradeDataVendorReply {
        type Command = FieldUpgradeDataVendorCmd;

        fn deserialize(bytes: &[u8]) -> Option<Self> {
            Some(Self::read_from_prefix(bytes).ok()?.0)
        }

        fn payload_size(&self) -> usize {
            size_of::<Self>()
        }
    }

    // === FieldUpgradeFinalizeVendor === //

    #[repr(C)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct FieldUpgradeFinalizeVendorCmd {
        header: CmdHeader,
    }

    impl FieldUpgradeFinalizeVendorCmd {
        pub fn new(session_tag: SessionTag) -> Self {
            Self {
                header: CmdHeader::new::<Self>(session_tag, CC_FIELD_UPGRADE_FINALIZE_VENDOR),
            }
        }
    }

    #[repr(C)]
    #[derive(Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct FieldUpgradeFinalizeVendorReply {
        pub header: ReplyHeader,
    }

    impl TpmCommand for FieldUpgradeFinalizeVendorCmd {
        type Reply = FieldUpgradeFinalizeVendorReply;
    }

    impl TpmReply for FieldUpgradeFinalizeVendorReply {
        type Command = FieldUpgradeFinalizeVendorCmd;

        fn deserialize(bytes: &[u8]) -> Option<Self> {
            Some(Self::read_from_prefix(bytes).ok()?.0)
        }

        fn payload_size(&self) -> usize {
            size_of::<Self>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::*;
    use super::*;

    #[test]
    fn test_startup_cmd() {
        const EXPECTED_CMD: [u8; 12] = [
            0x80, 0x01, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x01, 0x44, 0x00, 0x00,
        ];
        let cmd = StartupCmd::new(SessionTagEnum::NoSessions.into(), StartupType::Clear);
        assert_eq!(cmd.as_bytes(), &EXPECTED_CMD);
    }

    #[test]
    fn test_start_auth_session_cmd() {
        let nonce = [0x11u8; 16];
        let cmd = StartAuthSessionCmd::new(
            SessionTagEnum::NoSessions.into(),
            &nonce,
            TPM_SE_POLICY,
            AlgIdEnum::SHA256.into(),
        )
        .unwrap();
        let bytes = cmd.serialize();
        assert_eq!(bytes.len(), cmd.payload_size());
        // header
        assert_eq!(&bytes[0..2], &[0x80, 0x01]);
        assert_eq!(&bytes[2..6], &(bytes.len() as u32).to_be_bytes());
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x01, 0x76]);
        // tpmKey, bind: TPM_RH_NULL
        assert_eq!(&bytes[10..14], &[0x40, 0x00, 0x00, 0x07]);
        assert_eq!(&bytes[14..18], &[0x40, 0x00, 0x00, 0x07]);
        // nonceCaller
        assert_eq!(&bytes[18..20], &[0x00, 0x10]);
        assert_eq!(&bytes[20..36], &nonce);
        // encryptedSalt (empty), sessionType, symmetric NULL, authHash SHA256
        assert_eq!(&bytes[36..], &[0x00, 0x00, 0x01, 0x00, 0x10, 0x00, 0x0b]);
    }

    #[test]
    fn test_start_auth_session_reply() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x80, 0x01]); // tag
        bytes.extend_from_slice(&32u32.to_be_bytes()); // size
        bytes.extend_from_slice(&0u32.to_be_bytes()); // rc
        bytes.extend_from_slice(&0x0300_0000u32.to_be_bytes()); // session handle
        bytes.extend_from_slice(&16u16.to_be_bytes());
        bytes.extend_from_slice(&[0x22; 16]);

        let (reply, succeeded) =
            StartAuthSessionCmd::base_validate_reply(&bytes, SessionTagEnum::NoSessions).unwrap();
        assert!(succeeded);
        assert_eq!(reply.session_handle.get(), 0x0300_0000);
        assert_eq!(reply.nonce_tpm.as_slice(), &[0x22; 16]);
    }

    #[test]
    fn test_get_capability_properties_reply() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x80, 0x01]);
        bytes.extend_from_slice(&27u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.push(0); // moreData
        bytes.extend_from_slice(&TPM_CAP_TPM_PROPERTIES.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes()); // count
        bytes.extend_from_slice(&TPM_PT_MANUFACTURER.to_be_bytes());
        bytes.extend_from_slice(&MANUFACTURER_IFX.to_be_bytes());

        let reply = GetCapabilityReply::deserialize(&bytes).unwrap();
        assert_eq!(
            reply.capability_data.property(TPM_PT_MANUFACTURER),
            Some(MANUFACTURER_IFX)
        );
        assert_eq!(
            reply.capability_data.property(TPM_PT_FIRMWARE_VERSION_1),
            None
        );
        assert_eq!(reply.payload_size(), bytes.len());
    }

    #[test]
    fn test_get_capability_vendor_reply() {
        let blob = [0xab; 9];
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x80, 0x01]);
        bytes.extend_from_slice(&30u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&TPM_CAP_VENDOR_PROPERTY.to_be_bytes());
        bytes.extend_from_slice(&(blob.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&blob);

        let reply = GetCapabilityReply::deserialize(&bytes).unwrap();
        assert_eq!(reply.capability_data.vendor_blob.as_slice(), &blob);
    }

    #[test]
    fn test_truncated_replies_do_not_panic() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x80, 0x01]);
        bytes.extend_from_slice(&27u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&TPM_CAP_TPM_PROPERTIES.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&TPM_PT_MANUFACTURER.to_be_bytes());
        // value truncated
        for cut in 10..bytes.len() {
            assert!(GetCapabilityReply::deserialize(&bytes[..cut]).is_none());
        }
    }

    #[test]
    fn test_field_upgrade_data_cmd() {
        let data = vec![0x5a; 256];
        let cmd = FieldUpgradeDataVendorCmd::new(SessionTagEnum::NoSessions.into(), &data).unwrap();
        let bytes = cmd.serialize();
        assert_eq!(bytes.len(), 10 + 2 + 256);
        assert_eq!(&bytes[6..10], &0x2000_0141u32.to_be_bytes());
        assert_eq!(&bytes[10..12], &[0x01, 0x00]);
        assert_eq!(&bytes[2..6], &(bytes.len() as u32).to_be_bytes());
    }

    #[test]
    fn test_failed_reply_header_validation() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x80, 0x01]);
        bytes.extend_from_slice(&10u32.to_be_bytes());
        bytes.extend_from_slice(&(ResponseCode::Failure as u32).to_be_bytes());
        // Pad so a fixed-size reply struct can be read.
        bytes.resize(size_of::<FlushContextReply>(), 0);

        let (reply, succeeded) =
            FlushContextCmd::base_validate_reply(&bytes, SessionTagEnum::NoSessions).unwrap();
        assert!(!succeeded);
        assert_eq!(
            reply.header.response_code.get(),
            ResponseCode::Failure as u32
        );
    }
}
