// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The tool's 32-bit return-code space and the flow-level error carrying it.
//!
//! Every layer below reports typed errors; this module folds them into the
//! single code the CLI exits with. Codes returned by the chip itself are
//! carried OR'd with [`RC_TPM_MASK`] so callers can recover the raw value and
//! match on it.

use crate::commands::TpmCommandError;
use crate::crypto::CryptoError;
use crate::tpm_device::TpmIoError;
use thiserror::Error;

/// Marks a code as chip-returned. The mask's low bits are zero and every TPM
/// response code fits below them, so XOR recovers the raw code.
pub const RC_TPM_MASK: u32 = 0x8028_0000;

/// Tool return codes. The numeric values are stable: they are the process
/// exit codes documented for scripting against the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,

    // Envelope
    BadParameter = 0xe028_5001,
    Internal = 0xe028_5002,
    NotConnected = 0xe028_5003,
    AlreadyConnected = 0xe028_5004,
    TimedOut = 0xe028_5005,
    MalformedResponse = 0xe028_5006,
    InsufficientBuffer = 0xe028_5007,

    // Preconditions
    NotSupportedFeature = 0xe028_5010,
    NoIfxTpm = 0xe028_5011,
    UnsupportedChip = 0xe028_5012,
    Tpm12NoOwner = 0xe028_5013,
    Tpm12Owned = 0xe028_5014,
    Tpm12DeferredPpRequired = 0xe028_5015,
    Tpm12DisabledDeactivated = 0xe028_5016,
    Tpm12InvalidOwnerAuth = 0xe028_5017,
    Tpm20FailureMode = 0xe028_5018,
    RestartRequired = 0xe028_5019,
    FwUpdateBlocked = 0xe028_501a,

    // Image and configuration
    InvalidFwOption = 0xe028_5020,
    InvalidConfigOption = 0xe028_5021,
    InvalidSetting = 0xe028_5022,
    CorruptFwImage = 0xe028_5023,
    WrongFwImage = 0xe028_5024,
    WrongDecryptKeys = 0xe028_5025,
    NewerToolRequired = 0xe028_5026,
    FirmwareUpdateNotFound = 0xe028_5027,
    AlreadyUpToDate = 0xe028_5028,

    // Flow
    InvalidUpdateOption = 0xe028_5030,
    ResumeRunDataNotFound = 0xe028_5031,
    TpmFirmwareUpdate = 0xe028_5032,

    Fail = 0xe028_5100,
}

/// A flow-level failure: the numeric code plus the stored message shown to
/// the user.
#[derive(Debug, Error)]
#[error("{message} ({code:#010x})")]
pub struct FlowError {
    pub code: u32,
    pub message: String,
}

impl FlowError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as u32,
            message: message.into(),
        }
    }

    /// Wrap a chip-returned response code.
    pub fn chip(response_code: u32, message: impl Into<String>) -> Self {
        Self {
            code: RC_TPM_MASK | response_code,
            message: message.into(),
        }
    }

    /// The raw chip response code, if this error came from the chip.
    pub fn chip_code(&self) -> Option<u32> {
        if self.code & RC_TPM_MASK == RC_TPM_MASK && self.code != RC_TPM_MASK {
            Some(self.code ^ RC_TPM_MASK)
        } else {
            None
        }
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code as u32
    }
}

impl From<TpmIoError> for FlowError {
    fn from(err: TpmIoError) -> Self {
        let code = match &err {
            TpmIoError::AlreadyConnected => ErrorCode::AlreadyConnected,
            TpmIoError::NotConnected => ErrorCode::NotConnected,
            TpmIoError::TimedOut(_) => ErrorCode::TimedOut,
            TpmIoError::NotSupported => ErrorCode::NotSupportedFeature,
            TpmIoError::CommandTooLarge(_) => ErrorCode::InsufficientBuffer,
            TpmIoError::ShortResponse => ErrorCode::MalformedResponse,
            TpmIoError::Tis(_) | TpmIoError::Device(_) | TpmIoError::PrivilegeDrop(_) => {
                ErrorCode::Internal
            }
        };
        FlowError::new(code, err.to_string())
    }
}

impl From<TpmCommandError> for FlowError {
    fn from(err: TpmCommandError) -> Self {
        match err {
            TpmCommandError::Transmit(io) => io.into(),
            TpmCommandError::TpmCommandFailed { response_code } => {
                FlowError::chip(response_code, "the TPM rejected the command")
            }
            TpmCommandError::InvalidResponse(_) | TpmCommandError::MalformedResponse(_) => {
                FlowError::new(ErrorCode::MalformedResponse, err.to_string())
            }
            TpmCommandError::Marshal(_) => {
                FlowError::new(ErrorCode::InsufficientBuffer, err.to_string())
            }
            TpmCommandError::InvalidInputParameter(_) => {
                FlowError::new(ErrorCode::BadParameter, err.to_string())
            }
            TpmCommandError::Auth(_) => FlowError::new(ErrorCode::Internal, err.to_string()),
        }
    }
}

impl From<CryptoError> for FlowError {
    fn from(err: CryptoError) -> Self {
        FlowError::new(ErrorCode::Internal, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm12proto::TPM_BAD_PARAMETER;

    #[test]
    fn chip_code_round_trip() {
        let err = FlowError::chip(TPM_BAD_PARAMETER, "physical presence locked");
        assert_eq!(err.chip_code(), Some(TPM_BAD_PARAMETER));
        assert_eq!(err.code, 0x8028_0003);
    }

    #[test]
    fn tool_codes_are_not_chip_codes() {
        let err = FlowError::new(ErrorCode::Tpm12Owned, "owner installed");
        assert_eq!(err.chip_code(), None);
        assert!(err.is(ErrorCode::Tpm12Owned));
    }

    #[test]
    fn command_error_conversion() {
        let err: FlowError = TpmCommandError::TpmCommandFailed {
            response_code: 0x101,
        }
        .into();
        assert_eq!(err.chip_code(), Some(0x101));
    }
}
