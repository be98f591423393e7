// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TIS register protocol for memory-mapped TPM access.
//!
//! The register file starts at a platform-fixed physical base and exposes one
//! 4 KiB window per locality. All multi-byte registers are little-endian in
//! the register file; the command and response bytes pumped through the FIFO
//! are the big-endian TPM wire format and are not reinterpreted here.

use bitfield_struct::bitfield;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Physical base of the TIS register file.
pub const TIS_BASE: u64 = 0xfed4_0000;
/// One register window per locality.
pub const LOCALITY_STRIDE: u64 = 0x1000;
pub const LOCALITY_COUNT: u8 = 5;
/// Total size of the mapped register file.
pub const TIS_MMIO_SIZE: usize = (LOCALITY_COUNT as usize) * LOCALITY_STRIDE as usize;

// Register offsets within a locality window.
const REG_ACCESS: u64 = 0x00;
const REG_STS: u64 = 0x18;
const REG_BURST_COUNT: u64 = 0x19;
const REG_DATA_FIFO: u64 = 0x24;
const REG_DID_VID: u64 = 0xf00;

/// TPM vendor id of the target vendor in `TPM_DID_VID`.
pub const TPM_VID_IFX: u16 = 0x15d1;

/// Poll interval start; doubled on each miss up to [`POLL_SLEEP_MAX`]. Every
/// step yields the thread to the scheduler.
const POLL_SLEEP_START: Duration = Duration::from_millis(1);
const POLL_SLEEP_MAX: Duration = Duration::from_millis(16);

#[bitfield(u8)]
pub struct AccessReg {
    pub tpm_establishment: bool,
    pub request_use: bool,
    pub pending_request: bool,
    pub seize: bool,
    pub been_seized: bool,
    pub active_locality: bool,
    _reserved: bool,
    pub tpm_reg_valid_sts: bool,
}

#[bitfield(u8)]
pub struct StatusReg {
    _reserved0: bool,
    pub response_retry: bool,
    pub self_test_done: bool,
    pub expect: bool,
    pub data_avail: bool,
    pub tpm_go: bool,
    pub command_ready: bool,
    pub sts_valid: bool,
}

#[derive(Debug, Error)]
pub enum TisError {
    #[error("TPM access register reports no valid state for locality {0}")]
    AccessNotValid(u8),
    #[error("failed to acquire locality {0}")]
    LocalityRequest(u8),
    #[error("TPM did not enter the expected state within {0:?}")]
    TimedOut(Duration),
    #[error("TPM refused {got} of {requested} command bytes")]
    ShortWrite { requested: usize, got: usize },
    #[error("response header is malformed")]
    MalformedResponse,
    #[error("failed to map the TPM register file")]
    Map(#[source] std::io::Error),
}

/// Byte-level access to the TIS register file. The production implementation
/// maps `/dev/mem`; tests substitute an in-memory register model.
pub trait TisRegisters {
    fn read_u8(&self, offset: u64) -> u8;
    fn write_u8(&mut self, offset: u64, value: u8);

    fn read_u16(&self, offset: u64) -> u16 {
        u16::from_le_bytes([self.read_u8(offset), self.read_u8(offset + 1)])
    }

    fn read_u32(&self, offset: u64) -> u32 {
        u32::from_le_bytes([
            self.read_u8(offset),
            self.read_u8(offset + 1),
            self.read_u8(offset + 2),
            self.read_u8(offset + 3),
        ])
    }
}

/// The physical register file, mapped from `/dev/mem`. Requires root; the
/// caller drops privileges right after construction.
pub struct MmioRegisters {
    mapping: *mut u8,
}

// SAFETY: the mapping is a raw device window with no thread affinity; it is
// only ever touched from the single driving thread.
unsafe impl Send for MmioRegisters {}

impl MmioRegisters {
    pub fn map() -> Result<Self, TisError> {
        // SAFETY: calling into libc with a valid, NUL-terminated path.
        let fd = unsafe { libc::open(c"/dev/mem".as_ptr(), libc::O_RDWR | libc::O_SYNC) };
        if fd < 0 {
            return Err(TisError::Map(std::io::Error::last_os_error()));
        }

        // SAFETY: mapping a fresh region; length and offset are page aligned.
        let mapping = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                TIS_MMIO_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                TIS_BASE as libc::off_t,
            )
        };
        // The fd is not needed once the mapping exists.
        // SAFETY: fd is open and owned by this function.
        unsafe { libc::close(fd) };

        if mapping == libc::MAP_FAILED {
            return Err(TisError::Map(std::io::Error::last_os_error()));
        }

        Ok(Self {
            mapping: mapping.cast(),
        })
    }
}

impl Drop for MmioRegisters {
    fn drop(&mut self) {
        // SAFETY: unmapping the region mapped in `map`.
        unsafe {
            libc::munmap(self.mapping.cast(), TIS_MMIO_SIZE);
        }
    }
}

impl TisRegisters for MmioRegisters {
    fn read_u8(&self, offset: u64) -> u8 {
        debug_assert!((offset as usize) < TIS_MMIO_SIZE);
        // SAFETY: offset is within the mapped register file.
        unsafe { self.mapping.add(offset as usize).read_volatile() }
    }

    fn write_u8(&mut self, offset: u64, value: u8) {
        debug_assert!((offset as usize) < TIS_MMIO_SIZE);
        // SAFETY: offset is within the mapped register file.
        unsafe { self.mapping.add(offset as usize).write_volatile(value) }
    }
}

/// One TIS transaction engine bound to a locality.
pub struct TisDevice<R: TisRegisters> {
    regs: R,
    locality: u8,
}

impl<R: TisRegisters> TisDevice<R> {
    pub fn new(regs: R, locality: u8) -> Self {
        TisDevice { regs, locality }
    }

    fn reg(&self, offset: u64) -> u64 {
        self.locality as u64 * LOCALITY_STRIDE + offset
    }

    fn read_access(&self) -> AccessReg {
        AccessReg::from_bits(self.regs.read_u8(self.reg(REG_ACCESS)))
    }

    fn read_status(&self) -> StatusReg {
        StatusReg::from_bits(self.regs.read_u8(self.reg(REG_STS)))
    }

    fn write_status(&mut self, sts: StatusReg) {
        self.regs.write_u8(self.reg(REG_STS), sts.into_bits());
    }

    fn burst_count(&self) -> u16 {
        self.regs.read_u16(self.reg(REG_BURST_COUNT))
    }

    pub fn did_vid(&self) -> u32 {
        self.regs.read_u32(self.reg(REG_DID_VID))
    }

    /// Whether the access register reports a valid TPM state.
    pub fn is_access_valid(&self) -> bool {
        self.read_access().tpm_reg_valid_sts()
    }

    fn wait_access(
        &self,
        max_duration: Duration,
        pred: impl Fn(AccessReg) -> bool,
    ) -> Result<(), TisError> {
        self.wait(max_duration, |dev| pred(dev.read_access()))
    }

    fn wait_status(
        &self,
        max_duration: Duration,
        pred: impl Fn(StatusReg) -> bool,
    ) -> Result<(), TisError> {
        self.wait(max_duration, |dev| {
            let sts = dev.read_status();
            sts.sts_valid() && pred(sts)
        })
    }

    fn wait(
        &self,
        max_duration: Duration,
        pred: impl Fn(&Self) -> bool,
    ) -> Result<(), TisError> {
        let deadline = Instant::now() + max_duration;
        let mut sleep = POLL_SLEEP_START;
        loop {
            if pred(self) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TisError::TimedOut(max_duration));
            }
            std::thread::sleep(sleep);
            sleep = (sleep * 2).min(POLL_SLEEP_MAX);
        }
    }

    fn request_locality(&mut self, max_duration: Duration) -> Result<(), TisError> {
        if !self.is_access_valid() {
            return Err(TisError::AccessNotValid(self.locality));
        }
        self.regs.write_u8(
            self.reg(REG_ACCESS),
            AccessReg::new().with_request_use(true).into_bits(),
        );
        self.wait_access(max_duration, |access| access.active_locality())
            .map_err(|_| TisError::LocalityRequest(self.locality))
    }

    fn release_locality(&mut self) {
        self.regs.write_u8(
            self.reg(REG_ACCESS),
            AccessReg::new().with_active_locality(true).into_bits(),
        );
    }

    /// Run one command/response transaction. `max_duration` bounds the wait
    /// for the chip to finish executing the command.
    pub fn transceive(
        &mut self,
        command: &[u8],
        response: &mut [u8],
        max_duration: Duration,
    ) -> Result<usize, TisError> {
        self.request_locality(max_duration)?;
        let result = self.transceive_locked(command, response, max_duration);
        self.release_locality();
        result
    }

    fn transceive_locked(
        &mut self,
        command: &[u8],
        response: &mut [u8],
        max_duration: Duration,
    ) -> Result<usize, TisError> {
        // Ask for the idle state, then feed the command through the FIFO in
        // burst-count sized chunks.
        self.write_status(StatusReg::new().with_command_ready(true));
        self.wait_status(max_duration, |sts| sts.command_ready())?;

        let mut sent = 0;
        while sent < command.len() {
            let burst = self.burst_count() as usize;
            if burst == 0 {
                std::thread::sleep(POLL_SLEEP_START);
                continue;
            }
            let chunk = burst.min(command.len() - sent);
            for &byte in &command[sent..sent + chunk] {
                self.regs.write_u8(self.reg(REG_DATA_FIFO), byte);
            }
            sent += chunk;
        }

        // The chip must no longer expect data once the full command is in.
        self.wait_status(max_duration, |sts| !sts.expect())
            .map_err(|_| TisError::ShortWrite {
                requested: command.len(),
                got: sent,
            })?;

        self.write_status(StatusReg::new().with_tpm_go(true));
        self.wait_status(max_duration, |sts| sts.data_avail())?;

        // Drain the response, header first to learn the total size.
        let mut received = 0;
        let mut total = response.len().min(10);
        while received < total {
            if !self.read_status().data_avail() {
                return Err(TisError::MalformedResponse);
            }
            let burst = self.burst_count() as usize;
            if burst == 0 {
                std::thread::sleep(POLL_SLEEP_START);
                continue;
            }
            let chunk = burst.min(total - received);
            for slot in &mut response[received..received + chunk] {
                *slot = self.regs.read_u8(self.reg(REG_DATA_FIFO));
            }
            received += chunk;

            if received >= 10 && total == 10 {
                let declared =
                    u32::from_be_bytes(response[2..6].try_into().unwrap()) as usize;
                if declared < 10 || declared > response.len() {
                    return Err(TisError::MalformedResponse);
                }
                total = declared;
            }
        }

        // Return the chip to idle.
        self.write_status(StatusReg::new().with_command_ready(true));
        Ok(received)
    }
}
