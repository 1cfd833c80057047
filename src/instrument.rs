//! The capability a [`DeviceSession`](crate::DeviceSession) drives.
//!
//! Implemented by the native library backend ([`DwfInstrument`](crate::DwfInstrument))
//! and by [`SimulatedInstrument`](crate::SimulatedInstrument).

use crate::{AcquisitionConfig, ChannelConfig, InstrumentError};

/// Raw device handle. `0` is the "unopened" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub i32);

impl DeviceHandle {
    pub const NONE: Self = Self(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Analog-in state as reported by a status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Ready,
    Armed,
    Done,
    Triggered,
    Config,
    Prefill,
    Waiting,
    Unknown(u8),
}

impl From<u8> for CaptureStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::Armed,
            2 => Self::Done,
            3 => Self::Triggered,
            4 => Self::Config,
            5 => Self::Prefill,
            7 => Self::Waiting,
            other => Self::Unknown(other),
        }
    }
}

impl CaptureStatus {
    pub fn is_done(self) -> bool {
        self == Self::Done
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub serial: String,
    pub library_version: String,
}

pub trait Instrument {
    /// Number of devices currently attached.
    fn device_count(&mut self) -> Result<usize, InstrumentError>;

    fn device_info(&mut self, index: usize) -> Result<DeviceInfo, InstrumentError>;

    /// Open the enumerated device at `index`. An invalid handle in the `Ok`
    /// case means the library refused the device without reporting an error.
    fn open(&mut self, index: usize) -> Result<DeviceHandle, InstrumentError>;

    fn close(&mut self, handle: DeviceHandle);

    /// Number of analog-in channels on the open device.
    fn channel_count(&mut self, handle: DeviceHandle) -> Result<usize, InstrumentError>;

    fn configure_channel(
        &mut self,
        handle: DeviceHandle,
        channel: &ChannelConfig,
    ) -> Result<(), InstrumentError>;

    fn configure_acquisition(
        &mut self,
        handle: DeviceHandle,
        acq: &AcquisitionConfig,
    ) -> Result<(), InstrumentError>;

    /// Start a capture that completes once the trigger condition is met and
    /// the buffer is full.
    fn arm(&mut self, handle: DeviceHandle) -> Result<(), InstrumentError>;

    fn status(&mut self, handle: DeviceHandle) -> Result<CaptureStatus, InstrumentError>;

    /// Copy the last capture of `channel` into `dest`, returning the number of
    /// valid samples written (never more than `dest.len()`).
    fn read(
        &mut self,
        handle: DeviceHandle,
        channel: usize,
        dest: &mut [f64],
    ) -> Result<usize, InstrumentError>;

    /// Cancel an armed capture.
    fn abort(&mut self, handle: DeviceHandle) -> Result<(), InstrumentError>;
}
