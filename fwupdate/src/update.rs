// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The update driver: classify the chip, check the image, prepare
//! authorization, stream the payload, and survive interruption-then-resume.

use crate::commands::TpmCommands;
use crate::config::UpdateConfig;
use crate::error::ErrorCode;
use crate::error::FlowError;
use crate::fieldupgrade;
use crate::fwimage::FirmwareImage;
use crate::fwimage::FwImageError;
use crate::prepare;
use crate::probe::TpmState;
use crate::properties;
use crate::properties::PropertyBag;
use crate::rundata::RunData;
use crate::tpm12proto;
use crate::tpm20proto::ResponseCode;
use crate::tpm_device::TpmTransport;
use crate::UpdateType;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// Invoked after every acknowledged block with the cumulative percentage;
/// the sequence is non-decreasing and ends at 100 iff the update succeeds.
/// Callbacks must not issue further TPM commands.
pub type ProgressCallback<'a> = &'a mut dyn FnMut(u32);

const FIRMWARE_FILE_EXTENSION: &str = "BIN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub update_type: UpdateType,
    pub firmware_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub dry_run: bool,
    pub ignore_complete_error: bool,
}

impl UpdateRequest {
    /// Build the request from the property storage the CLI populated.
    pub fn from_properties(props: &PropertyBag) -> Result<Self, FlowError> {
        let update_type = props
            .get_string(properties::PROPERTY_UPDATE_TYPE)
            .and_then(UpdateType::from_option)
            .ok_or_else(|| {
                FlowError::new(
                    ErrorCode::InvalidUpdateOption,
                    "no valid update type in the property storage",
                )
            })?;
        let firmware_path = props
            .get_string(properties::PROPERTY_FIRMWARE_PATH)
            .map(PathBuf::from);
        let config_path = props
            .get_string(properties::PROPERTY_CONFIG_FILE_PATH)
            .map(PathBuf::from);

        match update_type {
            UpdateType::ConfigFileDriven => {
                if config_path.is_none() {
                    return Err(FlowError::new(
                        ErrorCode::InvalidConfigOption,
                        "the config-file update type requires a config file path",
                    ));
                }
            }
            _ => {
                if firmware_path.is_none() {
                    return Err(FlowError::new(
                        ErrorCode::InvalidFwOption,
                        "no firmware image path given",
                    ));
                }
            }
        }

        Ok(Self {
            update_type,
            firmware_path,
            config_path,
            dry_run: props
                .get_bool(properties::PROPERTY_DRY_RUN)
                .unwrap_or(false),
            ignore_complete_error: props
                .get_bool(properties::PROPERTY_IGNORE_ERROR_ON_COMPLETE)
                .unwrap_or(false),
        })
    }
}

/// How far the flow progressed before it returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResultSubtype {
    IsUpdatable,
    Prepare,
    Update,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriState {
    Na,
    Yes,
    No,
}

/// Outcome record of one driver run. `return_code` is zero on success;
/// otherwise one of the [`ErrorCode`] values or a masked chip code.
#[derive(Debug)]
pub struct UpdateResult {
    pub subtype: ResultSubtype,
    pub return_code: u32,
    pub new_firmware_valid: TriState,
    pub target_family: Option<&'static str>,
    pub new_firmware_version: String,
    pub used_firmware_image: Option<PathBuf>,
    pub error_details: Option<String>,
}

impl UpdateResult {
    fn new() -> Self {
        Self {
            subtype: ResultSubtype::IsUpdatable,
            return_code: ErrorCode::Fail as u32,
            new_firmware_valid: TriState::Na,
            target_family: None,
            new_firmware_version: String::new(),
            used_firmware_image: None,
            error_details: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.return_code == ErrorCode::Success as u32
    }
}

/// Wire encoding used for the payload transfer, fixed once authorization is
/// prepared. The boot loader only speaks the 1.2-format encodings.
enum TransferEncoding {
    Tpm12,
    Tpm20 { policy_session: u32 },
}

pub struct UpdateFlow<'a, T: TpmTransport> {
    commands: &'a mut TpmCommands<T>,
    run_data: RunData,
    dry_run_step: Duration,
}

impl<'a, T: TpmTransport> UpdateFlow<'a, T> {
    pub fn new(commands: &'a mut TpmCommands<T>, run_data: RunData) -> Self {
        Self {
            commands,
            run_data,
            dry_run_step: Duration::from_secs(2),
        }
    }

    #[cfg(test)]
    fn without_dry_run_delay(mut self) -> Self {
        self.dry_run_step = Duration::ZERO;
        self
    }

    /// Drive the whole flow against an already probed chip state.
    pub fn execute(
        &mut self,
        request: &UpdateRequest,
        state: &TpmState,
        progress: ProgressCallback<'_>,
    ) -> UpdateResult {
        let mut result = UpdateResult::new();
        match self.run(request, state, progress, &mut result) {
            Ok(()) => {
                result.return_code = ErrorCode::Success as u32;
            }
            Err(err) => {
                tracing::error!(code = err.code, message = %err.message, "update flow failed");
                result.return_code = err.code;
                result.error_details = Some(err.message);
            }
        }
        result
    }

    fn run(
        &mut self,
        request: &UpdateRequest,
        state: &TpmState,
        progress: ProgressCallback<'_>,
        result: &mut UpdateResult,
    ) -> Result<(), FlowError> {
        let (image, image_path, update_type) = self.check_updatable(request, state, result)?;

        if request.dry_run {
            // A rehearsal: nothing is sent to the chip, the progress source
            // is synthetic.
            for percent in [25, 50, 75, 100] {
                std::thread::sleep(self.dry_run_step);
                progress(percent);
            }
            return Ok(());
        }

        result.subtype = ResultSubtype::Prepare;
        let encoding = self.prepare_auth(state, update_type)?;

        result.subtype = ResultSubtype::Update;
        let transfer = self.transfer(request, &image, &image_path, &encoding, progress);
        if let TransferEncoding::Tpm20 { policy_session } = encoding {
            prepare::flush_session(self.commands, policy_session);
        }
        transfer?;

        // The chip took the whole image; the marker has served its purpose.
        self.run_data.remove();
        Ok(())
    }

    /// PROBE_STATE / CHECK_UPDATABLE / CHECK_IMAGE: preconditions, image
    /// resolution, and image-versus-chip compatibility.
    fn check_updatable(
        &mut self,
        request: &UpdateRequest,
        state: &TpmState,
        result: &mut UpdateResult,
    ) -> Result<(FirmwareImage, PathBuf, UpdateType), FlowError> {
        if !state.is_infineon {
            return Err(FlowError::new(
                ErrorCode::NoIfxTpm,
                "the detected TPM is not an Infineon TPM",
            ));
        }
        if state.is_unsupported_chip {
            return Err(FlowError::new(
                ErrorCode::UnsupportedChip,
                "the detected TPM is not supported",
            ));
        }

        if !state.is_boot_loader {
            if state.is_12 {
                if !matches!(
                    request.update_type,
                    UpdateType::Tpm12Pp | UpdateType::Tpm12TakeOwnership | UpdateType::ConfigFileDriven
                ) {
                    return Err(FlowError::new(
                        ErrorCode::InvalidUpdateOption,
                        "wrong update type for a TPM1.2",
                    ));
                }
                if state.is_12_owned {
                    return Err(FlowError::new(
                        ErrorCode::Tpm12Owned,
                        "the TPM1.2 has an owner; the update cannot run",
                    ));
                }
            }
            if state.is_20
                && !matches!(
                    request.update_type,
                    UpdateType::Tpm20EmptyPlatformAuth | UpdateType::ConfigFileDriven
                )
            {
                return Err(FlowError::new(
                    ErrorCode::InvalidUpdateOption,
                    "wrong update type for a TPM2.0",
                ));
            }
            if state.is_20_restart_required {
                return Err(FlowError::new(
                    ErrorCode::RestartRequired,
                    "the system must be restarted before the TPM accepts an update",
                ));
            }
            if state.is_20_in_failure_mode {
                return Err(FlowError::new(
                    ErrorCode::Tpm20FailureMode,
                    "the TPM2.0 is in failure mode",
                ));
            }
            if state.remaining_updates == 0 {
                return Err(FlowError::new(
                    ErrorCode::FwUpdateBlocked,
                    "the TPM has no firmware updates left",
                ));
            }
        }

        let (image_path, update_type) = self.resolve_image_path(request, state, result)?;
        result.used_firmware_image = Some(image_path.clone());

        let data = fs_err::read(&image_path).map_err(|err| {
            FlowError::new(
                ErrorCode::InvalidFwOption,
                format!("failed to load the firmware image: {err}"),
            )
        })?;

        let image = FirmwareImage::parse(&data).map_err(|err| {
            result.new_firmware_valid = TriState::No;
            match err {
                FwImageError::Corrupt(_) => FlowError::new(ErrorCode::CorruptFwImage, err.to_string()),
                FwImageError::NewerToolRequired(_) => {
                    FlowError::new(ErrorCode::NewerToolRequired, err.to_string())
                }
            }
        })?;

        result.target_family = Some(family_str(image.target_family_tag));
        result.new_firmware_version = image.target_version.clone();

        // The boot loader has no family to match; everything else must be an
        // allowed source of this image.
        if !state.is_boot_loader {
            let chip_family = if state.is_12 {
                fieldupgrade::FAMILY_TPM12
            } else {
                fieldupgrade::FAMILY_TPM20
            };
            if !image.accepts_source_family(chip_family) {
                result.new_firmware_valid = TriState::No;
                return Err(FlowError::new(
                    ErrorCode::WrongFwImage,
                    "the firmware image is not valid for this TPM",
                ));
            }
            if !image.matches_key_digests(&state.key_digests) {
                result.new_firmware_valid = TriState::No;
                return Err(FlowError::new(
                    ErrorCode::WrongDecryptKeys,
                    "the TPM does not hold decrypt keys matching the firmware image",
                ));
            }
            if state.max_data_size != 0 && image.max_block_size() > state.max_data_size as usize {
                result.new_firmware_valid = TriState::No;
                return Err(FlowError::new(
                    ErrorCode::WrongFwImage,
                    "the firmware image blocks exceed the TPM data size",
                ));
            }
        }

        result.new_firmware_valid = TriState::Yes;
        Ok((image, image_path, update_type))
    }

    /// Resolve which image file to use and the effective update type.
    fn resolve_image_path(
        &mut self,
        request: &UpdateRequest,
        state: &TpmState,
        result: &mut UpdateResult,
    ) -> Result<(PathBuf, UpdateType), FlowError> {
        if request.update_type != UpdateType::ConfigFileDriven {
            if state.is_boot_loader {
                // Interrupted update: the marker recorded which image was in
                // flight.
                let path = self.run_data.read().ok_or_else(|| {
                    FlowError::new(
                        ErrorCode::ResumeRunDataNotFound,
                        "the run data file required to resume the update is missing",
                    )
                })?;
                return Ok((path, request.update_type));
            }
            let path = request.firmware_path.clone().ok_or_else(|| {
                FlowError::new(ErrorCode::InvalidFwOption, "no firmware image path given")
            })?;
            return Ok((path, request.update_type));
        }

        let config_path = request.config_path.clone().ok_or_else(|| {
            FlowError::new(ErrorCode::InvalidConfigOption, "no config file path given")
        })?;
        let content = fs_err::read_to_string(&config_path).map_err(|err| {
            FlowError::new(
                ErrorCode::InvalidConfigOption,
                format!("the config file cannot be read: {err}"),
            )
        })?;
        let config = UpdateConfig::parse(&content)
            .map_err(|err| FlowError::new(ErrorCode::InvalidSetting, err.to_string()))?;

        if state.is_boot_loader {
            // Config settings are not evaluated in boot loader mode; the
            // image recorded in the run data file is the one to finish.
            let path = self.run_data.read().ok_or_else(|| {
                FlowError::new(
                    ErrorCode::ResumeRunDataNotFound,
                    "the run data file required to resume the update is missing",
                )
            })?;
            return Ok((path, request.update_type));
        }

        // LPC parts report 4.x/5.x version names, SPI parts 6.x/7.x.
        let current = state.firmware_version.as_str();
        let target_version = match current.split_once('.').map(|(major, _)| major) {
            Some("6") | Some("7") => config.target_version_spi.clone(),
            Some("4") | Some("5") => config.target_version_lpc.clone(),
            _ => {
                return Err(FlowError::new(
                    ErrorCode::UnsupportedChip,
                    format!("the detected TPM version ({current}) is not supported"),
                ))
            }
        }
        .expect("finalize checked the mandatory settings");

        if target_version == current {
            result.new_firmware_valid = TriState::No;
            return Err(FlowError::new(
                ErrorCode::AlreadyUpToDate,
                "the TPM firmware is already up to date",
            ));
        }

        let source_family = state.family_str().ok_or_else(|| {
            FlowError::new(ErrorCode::Fail, "the TPM family could not be detected")
        })?;
        let target_family = match target_version.split_once('.').map(|(major, _)| major) {
            Some("4") | Some("6") => "TPM12",
            Some("5") | Some("7") => "TPM20",
            _ => {
                return Err(FlowError::new(
                    ErrorCode::InvalidSetting,
                    format!(
                        "the configured target firmware version ({target_version}) is not supported"
                    ),
                ))
            }
        };

        let file_name = format!(
            "{source_family}_{current}_to_{target_family}_{target_version}.{FIRMWARE_FILE_EXTENSION}"
        );
        let mut path = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        if let Some(folder) = &config.firmware_folder {
            if !matches!(folder.as_str(), "." | "./" | ".\\") {
                path.push(folder);
            }
        }
        path.push(&file_name);

        if !path.exists() {
            return Err(FlowError::new(
                ErrorCode::FirmwareUpdateNotFound,
                format!(
                    "no firmware image found to update the current TPM firmware ({})",
                    path.display()
                ),
            ));
        }

        let update_type = if state.is_12 {
            config.update_type12
        } else {
            config.update_type20
        }
        .expect("finalize checked the mandatory settings");

        Ok((path, update_type))
    }

    /// PREPARE_AUTH: run the authorization path for the effective update
    /// type and fix the transfer encoding.
    fn prepare_auth(
        &mut self,
        state: &TpmState,
        update_type: UpdateType,
    ) -> Result<TransferEncoding, FlowError> {
        if state.is_boot_loader {
            // The interrupted chip accepts the transfer straight away.
            return Ok(TransferEncoding::Tpm12);
        }

        if state.is_20 {
            let policy_session = prepare::prepare_tpm20_policy(self.commands)?;
            return Ok(TransferEncoding::Tpm20 { policy_session });
        }

        match update_type {
            UpdateType::Tpm12Pp => {
                if state.has_deferred_pp {
                    // Deferred physical presence is already latched; no
                    // commands needed.
                    tracing::debug!("deferred physical presence already set");
                } else {
                    prepare::prepare_tpm12_physical_presence(self.commands)?;
                }
            }
            UpdateType::Tpm12TakeOwnership => {
                prepare::prepare_tpm12_ownership(self.commands)?;
            }
            _ => {
                return Err(FlowError::new(
                    ErrorCode::InvalidUpdateOption,
                    "no authorization path for the requested update type",
                ));
            }
        }
        Ok(TransferEncoding::Tpm12)
    }

    /// START_TRANSFER / TRANSFER_BLOCKS / COMPLETE.
    fn transfer(
        &mut self,
        request: &UpdateRequest,
        image: &FirmwareImage,
        image_path: &Path,
        encoding: &TransferEncoding,
        progress: ProgressCallback<'_>,
    ) -> Result<(), FlowError> {
        match encoding {
            TransferEncoding::Tpm12 => self
                .commands
                .field_upgrade_start_12(&image.trailer)
                .map_err(FlowError::from)?,
            TransferEncoding::Tpm20 { policy_session } => self
                .commands
                .field_upgrade_start_20(*policy_session, &image.trailer)
                .map_err(FlowError::from)?,
        }

        let total = image.total_payload_bytes();
        let mut sent = 0usize;
        for (index, block) in image.payload_blocks.iter().enumerate() {
            match encoding {
                TransferEncoding::Tpm12 => self.commands.field_upgrade_update_12(block),
                TransferEncoding::Tpm20 { .. } => self.commands.field_upgrade_data_20(block),
            }
            .map_err(FlowError::from)?;

            if index == 0 {
                // The chip is now committed; record how to finish the job if
                // this host dies before COMPLETE.
                self.run_data.write(image_path);
            }
            sent += block.len();
            progress((sent * 100 / total) as u32);
        }

        let complete = match encoding {
            TransferEncoding::Tpm12 => self.commands.field_upgrade_complete_12(),
            TransferEncoding::Tpm20 { .. } => self.commands.field_upgrade_finalize_20(),
        };
        if let Err(err) = complete {
            let chip_fail = matches!(
                err.chip_code(),
                Some(code) if code == tpm12proto::TPM_FAIL || code == ResponseCode::Failure as u32
            );
            if request.ignore_complete_error && chip_fail {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "ignoring the error from the completion command as requested"
                );
            } else {
                return Err(err.into());
            }
        }
        Ok(())
    }
}

fn family_str(tag: u16) -> &'static str {
    match tag {
        fieldupgrade::FAMILY_TPM12 => "TPM12",
        fieldupgrade::FAMILY_TPM20 => "TPM20",
        _ => "unknown",
    }
}
