// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-field firmware update engine for Infineon TPM 1.2 and 2.0 chips.
//!
//! The engine drives a chip through a precondition-check phase, an
//! authorization-preparation phase, and a sector-by-sector image transfer,
//! reporting progress through a callback and surviving interruption across a
//! host reboot via a resume marker file. It talks to the chip either through
//! the memory-mapped TIS register file or through the kernel driver's
//! character device.

pub mod codec;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fieldupgrade;
pub mod fwimage;
pub mod prepare;
pub mod probe;
pub mod properties;
pub mod rundata;
#[cfg(test)]
pub(crate) mod test_support;
pub mod tis;
pub mod tpm12proto;
pub mod tpm20proto;
pub mod tpm_device;
pub mod update;

pub use commands::TpmCommands;
pub use error::ErrorCode;
pub use error::FlowError;
pub use probe::TpmState;
pub use tpm_device::AccessMode;
pub use tpm_device::TpmChannel;
pub use tpm_device::TpmTransport;
pub use update::ProgressCallback;
pub use update::UpdateRequest;
pub use update::UpdateResult;

use probe::probe_state;
use rundata::RunData;
use std::path::PathBuf;
use update::UpdateFlow;

/// How the host is authorized to perform the update.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateType {
    /// TPM1.2 via (deferred) physical presence.
    Tpm12Pp,
    /// TPM1.2 by taking ownership with the built-in owner authorization.
    Tpm12TakeOwnership,
    /// TPM2.0 with the well-known empty platform auth.
    Tpm20EmptyPlatformAuth,
    /// Everything read from the update config file.
    ConfigFileDriven,
}

impl UpdateType {
    /// Parse the option value used on the command line and in config files.
    pub fn from_option(value: &str) -> Option<UpdateType> {
        let ret = match value {
            config::OPTION_TPM12_PP => Self::Tpm12Pp,
            config::OPTION_TPM12_TAKEOWNERSHIP => Self::Tpm12TakeOwnership,
            config::OPTION_TPM20_EMPTYPLATFORMAUTH => Self::Tpm20EmptyPlatformAuth,
            config::OPTION_CONFIG_FILE => Self::ConfigFileDriven,
            _ => return None,
        };
        Some(ret)
    }
}

/// One engine drives one chip through one operation. The CLI instantiates
/// exactly one per process.
pub struct UpdateEngine<T: TpmTransport> {
    commands: TpmCommands<T>,
    run_data_path: PathBuf,
}

impl<T: TpmTransport> UpdateEngine<T> {
    pub fn new(transport: T) -> Self {
        Self {
            commands: TpmCommands::new(transport),
            run_data_path: PathBuf::from(rundata::RUN_DATA_FILE),
        }
    }

    /// Place the resume marker somewhere other than the working directory.
    pub fn with_run_data_path(mut self, path: PathBuf) -> Self {
        self.run_data_path = path;
        self
    }

    /// The `-info` flow: probe the chip and report its state.
    pub fn info(&mut self) -> Result<TpmState, FlowError> {
        probe_state(&mut self.commands)
    }

    /// The `-update` flow.
    pub fn update(
        &mut self,
        request: &UpdateRequest,
        progress: ProgressCallback<'_>,
    ) -> UpdateResult {
        let state = match probe_state(&mut self.commands) {
            Ok(state) => state,
            Err(err) => return failed_result(err),
        };
        let run_data = RunData::new(self.run_data_path.clone());
        UpdateFlow::new(&mut self.commands, run_data).execute(request, &state, progress)
    }

    /// The `-tpm12-clearownership` flow.
    pub fn clear_ownership(&mut self) -> Result<(), FlowError> {
        let state = probe_state(&mut self.commands)?;
        prepare::clear_tpm12_ownership(&mut self.commands, &state)
    }
}

fn failed_result(err: FlowError) -> UpdateResult {
    UpdateResult {
        subtype: update::ResultSubtype::IsUpdatable,
        return_code: err.code,
        new_firmware_valid: update::TriState::Na,
        target_family: None,
        new_firmware_version: String::new(),
        used_firmware_image: None,
        error_details: Some(err.message),
    }
}
