// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The physical TPM channel: either the memory-mapped TIS register file or
//! the kernel driver's character device.
//!
//! Opening either backend needs elevated privileges (mapping the register
//! window, or opening `/dev/tpm0`); the process drops its effective uid/gid
//! to the real ones as soon as the channel is open. A failed drop is fatal.

use crate::tis::MmioRegisters;
use crate::tis::TisDevice;
use crate::tis::TisError;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for a single command or response.
pub const MAX_TRANSMIT_SIZE: usize = 4096;

/// Default character device of the kernel driver backend.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/tpm0";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessMode {
    /// Drive the TIS register file directly.
    MemoryBased = 1,
    /// Let the kernel driver run TIS; exchange via the device file.
    Driver = 3,
}

impl AccessMode {
    pub fn from_u32(val: u32) -> Option<AccessMode> {
        let ret = match val {
            1 => Self::MemoryBased,
            3 => Self::Driver,
            _ => return None,
        };
        Some(ret)
    }
}

#[derive(Debug, Error)]
pub enum TpmIoError {
    #[error("already connected to the TPM")]
    AlreadyConnected,
    #[error("not connected to the TPM")]
    NotConnected,
    #[error("command of {0} bytes exceeds the transmit limit")]
    CommandTooLarge(usize),
    #[error("the TPM did not respond within {0:?}")]
    TimedOut(Duration),
    #[error("register access is not supported by the driver backend")]
    NotSupported,
    #[error("TIS transaction failed")]
    Tis(#[source] TisError),
    #[error("device file I/O failed")]
    Device(#[source] std::io::Error),
    #[error("failed to drop process privileges")]
    PrivilegeDrop(#[source] std::io::Error),
    #[error("response is shorter than a TPM header")]
    ShortResponse,
}

/// Request/response exchange with a TPM. The update engine only depends on
/// this seam, so tests can substitute a scripted chip.
pub trait TpmTransport {
    /// Send one command and return the matching response. `max_duration`
    /// bounds how long the transport waits for the chip.
    fn transmit(&mut self, command: &[u8], max_duration: Duration)
        -> Result<Vec<u8>, TpmIoError>;
}

enum Backend {
    Tis(Box<TisDevice<MmioRegisters>>),
    Driver(fs_err::File),
}

/// An open TPM channel. Constructed by [`TpmDeviceConnection::connect`],
/// closed by [`TpmDeviceConnection::disconnect`] (also attempted on drop).
pub struct TpmDeviceConnection {
    backend: Backend,
}

impl TpmDeviceConnection {
    /// Open the channel and drop privileges. A second live connection is the
    /// caller's bug; the engine owns exactly one.
    pub fn connect(
        mode: AccessMode,
        device_path: &Path,
        locality: u8,
    ) -> Result<Self, TpmIoError> {
        let backend = match mode {
            AccessMode::MemoryBased => {
                let regs = MmioRegisters::map().map_err(TpmIoError::Tis)?;
                let device = TisDevice::new(regs, locality);
                if !device.is_access_valid() {
                    return Err(TpmIoError::Tis(TisError::AccessNotValid(locality)));
                }
                tracing::debug!(locality, "using memory mapped TPM access");
                Backend::Tis(Box::new(device))
            }
            AccessMode::Driver => {
                let file = fs_err::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(device_path)
                    .map_err(TpmIoError::Device)?;
                tracing::debug!(path = %device_path.display(), "using TPM driver access");
                Backend::Driver(file)
            }
        };

        drop_privileges()?;
        tracing::debug!("connected to TPM");

        Ok(Self { backend })
    }

    /// Vendor/device id register; only meaningful on the TIS backend.
    pub fn did_vid(&self) -> Result<u32, TpmIoError> {
        match &self.backend {
            Backend::Tis(device) => Ok(device.did_vid()),
            Backend::Driver(_) => Err(TpmIoError::NotSupported),
        }
    }
}

impl TpmTransport for TpmDeviceConnection {
    fn transmit(
        &mut self,
        command: &[u8],
        max_duration: Duration,
    ) -> Result<Vec<u8>, TpmIoError> {
        if command.len() > MAX_TRANSMIT_SIZE {
            return Err(TpmIoError::CommandTooLarge(command.len()));
        }

        let mut response = vec![0u8; MAX_TRANSMIT_SIZE];
        let len = match &mut self.backend {
            Backend::Tis(device) => device
                .transceive(command, &mut response, max_duration)
                .map_err(|err| match err {
                    TisError::TimedOut(duration) => TpmIoError::TimedOut(duration),
                    other => TpmIoError::Tis(other),
                })?,
            Backend::Driver(file) => {
                // One write delivers the command, one read collects the
                // response; the kernel driver serializes and waits.
                file.write_all(command).map_err(TpmIoError::Device)?;
                file.read(&mut response).map_err(TpmIoError::Device)?
            }
        };

        if len < 10 {
            return Err(TpmIoError::ShortResponse);
        }
        response.truncate(len);
        Ok(response)
    }
}

/// Give up the elevated ids acquired for opening the device. Keeping them
/// past connect would run the whole update flow as root.
fn drop_privileges() -> Result<(), TpmIoError> {
    // SAFETY: libc calls with no pointer arguments.
    unsafe {
        if libc::seteuid(libc::getuid()) != 0 {
            return Err(TpmIoError::PrivilegeDrop(std::io::Error::last_os_error()));
        }
        if libc::setegid(libc::getgid()) != 0 {
            return Err(TpmIoError::PrivilegeDrop(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Tracks the one allowed connection, enforcing the connect/disconnect
/// pairing: connect twice is an error, disconnect without connect is an
/// error.
pub struct TpmChannel {
    mode: AccessMode,
    device_path: PathBuf,
    locality: u8,
    connection: Option<TpmDeviceConnection>,
}

impl TpmChannel {
    pub fn new(mode: AccessMode, device_path: PathBuf, locality: u8) -> Self {
        Self {
            mode,
            device_path,
            locality,
            connection: None,
        }
    }

    pub fn connect(&mut self) -> Result<(), TpmIoError> {
        if self.connection.is_some() {
            return Err(TpmIoError::AlreadyConnected);
        }
        self.connection = Some(TpmDeviceConnection::connect(
            self.mode,
            &self.device_path,
            self.locality,
        )?);
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<(), TpmIoError> {
        match self.connection.take() {
            Some(connection) => {
                // Dropping the connection releases the mapping or closes the
                // device handle.
                drop(connection);
                tracing::debug!("disconnected from TPM");
                Ok(())
            }
            None => Err(TpmIoError::NotConnected),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

impl Drop for TpmChannel {
    fn drop(&mut self) {
        // Balance the connect even on error shutdown paths.
        if self.connection.is_some() {
            let _ = self.disconnect();
        }
    }
}

impl TpmTransport for TpmChannel {
    fn transmit(
        &mut self,
        command: &[u8],
        max_duration: Duration,
    ) -> Result<Vec<u8>, TpmIoError> {
        match &mut self.connection {
            Some(connection) => connection.transmit(command, max_duration),
            None => Err(TpmIoError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_mode_values() {
        assert_eq!(AccessMode::from_u32(1), Some(AccessMode::MemoryBased));
        assert_eq!(AccessMode::from_u32(3), Some(AccessMode::Driver));
        assert_eq!(AccessMode::from_u32(2), None);
    }

    #[test]
    fn disconnect_without_connect() {
        let mut channel = TpmChannel::new(
            AccessMode::Driver,
            PathBuf::from(DEFAULT_DEVICE_PATH),
            0,
        );
        assert!(matches!(
            channel.disconnect(),
            Err(TpmIoError::NotConnected)
        ));
    }

    #[test]
    fn transmit_without_connect() {
        let mut channel = TpmChannel::new(
            AccessMode::Driver,
            PathBuf::from(DEFAULT_DEVICE_PATH),
            0,
        );
        assert!(matches!(
            channel.transmit(&[0u8; 10], Duration::from_secs(1)),
            Err(TpmIoError::NotConnected)
        ));
    }
}
