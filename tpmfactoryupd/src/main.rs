// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command line front end for the TPM firmware update engine.

use clap::Parser;
use fwupdate::properties;
use fwupdate::properties::PropertyBag;
use fwupdate::properties::Value;
use fwupdate::update::ResultSubtype;
use fwupdate::update::TriState;
use fwupdate::AccessMode;
use fwupdate::ErrorCode;
use fwupdate::TpmChannel;
use fwupdate::TpmState;
use fwupdate::UpdateEngine;
use fwupdate::UpdateRequest;
use fwupdate::UpdateResult;
use std::io::Write;
use std::path::PathBuf;

mod tracing_init;

const DEFAULT_LOG_PATH: &str = "./TPMFactoryUpd.log";
const MAX_LOG_PATH_LEN: usize = 260;

/// Updates the firmware of an Infineon TPM1.2 or TPM2.0.
#[derive(Debug, Parser)]
#[clap(name = "TPMFactoryUpd", version)]
struct Cli {
    /// Probe the TPM and show its state
    #[clap(
        long,
        conflicts_with_all = ["update", "firmware", "config", "tpm12_clearownership"]
    )]
    info: bool,

    /// Update type: tpm12-PP | tpm12-takeownership | tpm20-emptyplatformauth | config-file
    #[clap(long, value_name = "TYPE", conflicts_with = "tpm12_clearownership")]
    update: Option<String>,

    /// Firmware image to flash
    #[clap(long, value_name = "PATH", conflicts_with_all = ["config", "tpm12_clearownership"])]
    firmware: Option<PathBuf>,

    /// Update config file (with -update config-file)
    #[clap(long, value_name = "PATH", conflicts_with = "tpm12_clearownership")]
    config: Option<PathBuf>,

    /// Enable logging, optionally to the given file
    #[clap(
        long,
        value_name = "PATH",
        num_args = 0..=1,
        default_missing_value = DEFAULT_LOG_PATH
    )]
    log: Option<PathBuf>,

    /// Remove the TPM1.2 owner installed by a previous update
    #[clap(long = "tpm12-clearownership")]
    tpm12_clearownership: bool,

    /// TPM access: 1 = memory mapped, 3 = kernel driver
    #[clap(long = "access-mode", value_name = "MODE", default_value_t = 3)]
    access_mode: u32,

    /// Device path for the driver access mode
    #[clap(long = "access-path", value_name = "PATH", default_value = fwupdate::tpm_device::DEFAULT_DEVICE_PATH)]
    access_path: PathBuf,

    /// Locality for the memory mapped access mode
    #[clap(long, value_name = "LOCALITY", default_value_t = 0)]
    locality: u8,

    /// Go through the motions without transferring anything
    #[clap(long = "dry-run")]
    dry_run: bool,

    /// Treat a TPM_FAIL from the final completion command as success
    #[clap(long = "ignore-error-on-complete")]
    ignore_error_on_complete: bool,
}

fn main() {
    let cli = Cli::parse();
    let code = run(cli);
    std::process::exit(code as i32);
}

fn run(cli: Cli) -> u32 {
    if let Some(path) = &cli.log {
        if path.as_os_str().len() > MAX_LOG_PATH_LEN {
            eprintln!("Error 0x{:08x}: the log file path is too long.", ErrorCode::BadParameter as u32);
            return ErrorCode::BadParameter as u32;
        }
        if let Err(err) = tracing_init::init(Some(path)) {
            eprintln!("Error 0x{:08x}: cannot open the log file: {err}", ErrorCode::Internal as u32);
            return ErrorCode::Internal as u32;
        }
    } else {
        let _ = tracing_init::init(None);
    }

    match execute(&cli) {
        Ok(code) => code,
        Err(err) => {
            let code = err
                .downcast_ref::<fwupdate::FlowError>()
                .map(|flow| flow.code)
                .unwrap_or(ErrorCode::Fail as u32);
            eprintln!("Error 0x{code:08x}: {err:#}");
            if let Some(path) = &cli.log {
                eprintln!("See the log file at {} for details.", path.display());
            }
            code
        }
    }
}

/// The property storage every layer reads its options from.
fn populate_properties(cli: &Cli) -> PropertyBag {
    let mut props = PropertyBag::new();
    props.add(
        properties::PROPERTY_TPM_DEVICE_ACCESS_MODE,
        Value::UInt(cli.access_mode),
    );
    props.add(
        properties::PROPERTY_TPM_DEVICE_ACCESS_PATH,
        Value::String(cli.access_path.display().to_string()),
    );
    props.add(
        properties::PROPERTY_LOCALITY,
        Value::UInt(cli.locality as u32),
    );
    if let Some(update) = &cli.update {
        props.add(properties::PROPERTY_UPDATE_TYPE, Value::String(update.clone()));
    }
    if let Some(firmware) = &cli.firmware {
        props.add(
            properties::PROPERTY_FIRMWARE_PATH,
            Value::String(firmware.display().to_string()),
        );
    }
    if let Some(config) = &cli.config {
        props.add(
            properties::PROPERTY_CONFIG_FILE_PATH,
            Value::String(config.display().to_string()),
        );
    }
    props.add(properties::PROPERTY_DRY_RUN, Value::Bool(cli.dry_run));
    props.add(
        properties::PROPERTY_IGNORE_ERROR_ON_COMPLETE,
        Value::Bool(cli.ignore_error_on_complete),
    );
    props
}

/// Tool settings from the config file fill in whatever the command line
/// left at its default.
fn apply_tool_config(cli: &Cli, props: &mut PropertyBag) {
    let Some(config_path) = &cli.config else {
        return;
    };
    let Ok(content) = std::fs::read_to_string(config_path) else {
        // The update flow reports unreadable config files with the proper
        // error code.
        return;
    };
    match fwupdate::config::ToolConfig::parse(&content) {
        Ok(tool) => {
            if cli.access_mode == 3 {
                if let Some(mode) = tool.device_access_mode {
                    props.change(
                        properties::PROPERTY_TPM_DEVICE_ACCESS_MODE,
                        Value::UInt(mode),
                    );
                }
            }
            if cli.locality == 0 {
                if let Some(locality) = tool.locality {
                    props.change(properties::PROPERTY_LOCALITY, Value::UInt(locality as u32));
                }
            }
        }
        Err(err) => tracing::debug!(
            error = &err as &dyn std::error::Error,
            "no tool settings taken from the config file"
        ),
    }
}

fn execute(cli: &Cli) -> anyhow::Result<u32> {
    let mut props = populate_properties(cli);
    apply_tool_config(cli, &mut props);

    let access_mode = props
        .get_uint(properties::PROPERTY_TPM_DEVICE_ACCESS_MODE)
        .and_then(AccessMode::from_u32)
        .ok_or_else(|| {
            anyhow::Error::new(fwupdate::FlowError::new(
                ErrorCode::InvalidSetting,
                format!("unknown access mode {}", cli.access_mode),
            ))
        })?;
    let access_path = PathBuf::from(
        props
            .get_string(properties::PROPERTY_TPM_DEVICE_ACCESS_PATH)
            .unwrap_or(fwupdate::tpm_device::DEFAULT_DEVICE_PATH),
    );
    let locality = props
        .get_uint(properties::PROPERTY_LOCALITY)
        .unwrap_or(0) as u8;

    let mut channel = TpmChannel::new(access_mode, access_path, locality);
    channel.connect().map_err(fwupdate::FlowError::from)?;
    // The channel travels into the engine and disconnects on drop, success
    // or error.
    dispatch(cli, &props, channel)
}

fn dispatch(cli: &Cli, props: &PropertyBag, channel: TpmChannel) -> anyhow::Result<u32> {
    let mut engine = UpdateEngine::new(channel);

    if cli.info {
        let state = engine.info().map_err(anyhow::Error::new)?;
        print_state(&state);
        return Ok(0);
    }

    if cli.tpm12_clearownership {
        engine.clear_ownership().map_err(anyhow::Error::new)?;
        println!("The TPM1.2 ownership was cleared successfully.");
        return Ok(0);
    }

    if cli.update.is_none() {
        anyhow::bail!(fwupdate::FlowError::new(
            ErrorCode::BadParameter,
            "one of --info, --update or --tpm12-clearownership is required",
        ));
    }
    let request = UpdateRequest::from_properties(props).map_err(anyhow::Error::new)?;

    println!("Updating the TPM firmware ...");
    let result = engine.update(&request, &mut |percent| {
        print!("\r  Completion: {percent:3}%");
        let _ = std::io::stdout().flush();
    });
    println!();
    print_result(&result);
    Ok(result.return_code)
}

fn print_state(state: &TpmState) {
    println!("TPM information:");
    println!("  Firmware valid          : {}", yes_no(!state.is_boot_loader));
    println!(
        "  TPM family              : {}",
        state.family_str().unwrap_or("N/A")
    );
    println!("  TPM firmware version    : {}", na_if_empty(&state.firmware_version));
    if state.is_12 {
        println!("  TPM1.2 owner set        : {}", yes_no(state.is_12_owned));
        println!("  Deferred PP set         : {}", yes_no(state.has_deferred_pp));
    }
    if state.is_20 {
        println!(
            "  TPM2.0 failure mode     : {}",
            yes_no(state.is_20_in_failure_mode)
        );
        println!(
            "  Restart required        : {}",
            yes_no(state.is_20_restart_required)
        );
        println!(
            "  Platform auth empty     : {}",
            yes_no(state.platform_auth_empty)
        );
        println!(
            "  Platform hierarchy      : {}",
            if state.platform_hierarchy_enabled {
                "enabled"
            } else {
                "disabled"
            }
        );
    }
    println!("  Boot loader mode        : {}", yes_no(state.is_boot_loader));
    println!("  Remaining updates       : {}", state.remaining_updates);
}

fn print_result(result: &UpdateResult) {
    if result.return_code == 0 {
        match result.subtype {
            ResultSubtype::Update => println!("The TPM firmware was updated successfully."),
            _ => println!("The operation completed successfully."),
        }
    } else {
        println!(
            "The TPM firmware update failed with error 0x{:08x}.",
            result.return_code
        );
        if let Some(details) = &result.error_details {
            println!("  {details}");
        }
    }
    if let Some(family) = result.target_family {
        println!("  Target family  : {family}");
    }
    if !result.new_firmware_version.is_empty() {
        println!("  Target version : {}", result.new_firmware_version);
    }
    println!(
        "  Image valid    : {}",
        match result.new_firmware_valid {
            TriState::Na => "N/A",
            TriState::Yes => "Yes",
            TriState::No => "No",
        }
    );
    if let Some(path) = &result.used_firmware_image {
        println!("  Image file     : {}", path.display());
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

fn na_if_empty(value: &str) -> &str {
    if value.is_empty() {
        "N/A"
    } else {
        value
    }
}
