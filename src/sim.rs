//! Simulated two-channel scope used when no hardware is attached and by the
//! test suite. Every call is recorded in a [`CallLog`].

use crate::{
    AcquisitionConfig, CaptureStatus, ChannelConfig, DeviceHandle, DeviceInfo, Instrument,
    InstrumentError, TriggerSource,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    f64::consts::TAU,
    sync::{Arc, Mutex, PoisonError},
};

const ERC_INVALID_HANDLE: i32 = 0x10;
const ERC_NOT_SUPPORTED: i32 = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    DeviceCount,
    DeviceInfo(usize),
    Open(usize),
    Close,
    ChannelCount,
    ConfigureChannel(ChannelConfig),
    ConfigureAcquisition(AcquisitionConfig),
    Arm,
    Status,
    Read { channel: usize, len: usize },
    Abort,
}

/// Shared record of the calls made on a [`SimulatedInstrument`].
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<SimCall>>>);

impl CallLog {
    fn push(&self, call: SimCall) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    pub fn snapshot(&self) -> Vec<SimCall> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, pred: impl Fn(&SimCall) -> bool) -> usize {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| pred(c))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct SimSettings {
    pub devices: usize,
    /// Raw handle returned by `open`; `0` simulates a refused device.
    pub open_handle: i32,
    pub channel_count: usize,
    /// Status polls after arming before the capture reports done.
    pub polls_to_done: u32,
    pub never_done: bool,
    pub fail_arm: bool,
    pub fail_read: bool,
    /// Reads that succeed before every later read fails.
    pub fail_read_after: Option<usize>,
    /// Valid samples per read; `None` fills the whole buffer.
    pub valid_samples: Option<usize>,
    pub signal_hz: f64,
    pub amplitude_volts: f64,
    pub noise_volts: f64,
    pub seed: u64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            devices: 1,
            open_handle: 1,
            channel_count: 2,
            polls_to_done: 3,
            never_done: false,
            fail_arm: false,
            fail_read: false,
            fail_read_after: None,
            valid_samples: None,
            signal_hz: 1000.0,
            amplitude_volts: 1.0,
            noise_volts: 0.02,
            seed: 0,
        }
    }
}

pub struct SimulatedInstrument {
    settings: SimSettings,
    calls: CallLog,
    rng: StdRng,
    open: bool,
    armed: bool,
    polls: u32,
    reads: usize,
    phase: f64,
    channels: Vec<ChannelConfig>,
    acq: AcquisitionConfig,
}

impl SimulatedInstrument {
    pub fn new(settings: SimSettings) -> Self {
        let rng = StdRng::seed_from_u64(settings.seed);
        Self {
            settings,
            calls: CallLog::default(),
            rng,
            open: false,
            armed: false,
            polls: 0,
            reads: 0,
            phase: 0.0,
            channels: Vec::new(),
            acq: AcquisitionConfig::default(),
        }
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    fn check_handle(&self, call: &'static str, handle: DeviceHandle) -> Result<(), InstrumentError> {
        if self.open && handle.0 == self.settings.open_handle {
            Ok(())
        } else {
            Err(InstrumentError::new(
                call,
                ERC_INVALID_HANDLE,
                format!("handle {} is not open", handle.0),
            ))
        }
    }

    fn sample(&mut self, channel: &ChannelConfig, t: f64) -> f64 {
        let shift = channel.index as f64 * TAU / 4.0;
        let clean = self.settings.amplitude_volts
            * (TAU * self.settings.signal_hz * t + self.phase + shift).sin();
        let noise = self.settings.noise_volts * (self.rng.random::<f64>() * 2.0 - 1.0);
        let (lo, hi) = channel.span();
        (clean + noise).clamp(lo, hi)
    }
}

impl Instrument for SimulatedInstrument {
    fn device_count(&mut self) -> Result<usize, InstrumentError> {
        self.calls.push(SimCall::DeviceCount);
        Ok(self.settings.devices)
    }

    fn device_info(&mut self, index: usize) -> Result<DeviceInfo, InstrumentError> {
        self.calls.push(SimCall::DeviceInfo(index));
        Ok(DeviceInfo {
            index,
            name: "Simulated Scope".into(),
            serial: format!("SIM{index:08}"),
            library_version: env!("CARGO_PKG_VERSION").into(),
        })
    }

    fn open(&mut self, index: usize) -> Result<DeviceHandle, InstrumentError> {
        self.calls.push(SimCall::Open(index));
        if index >= self.settings.devices {
            return Err(InstrumentError::new(
                "open",
                ERC_INVALID_HANDLE,
                format!("no device at index {index}"),
            ));
        }
        self.open = self.settings.open_handle != 0;
        Ok(DeviceHandle(self.settings.open_handle))
    }

    fn close(&mut self, _handle: DeviceHandle) {
        self.calls.push(SimCall::Close);
        self.open = false;
        self.armed = false;
    }

    fn channel_count(&mut self, handle: DeviceHandle) -> Result<usize, InstrumentError> {
        self.calls.push(SimCall::ChannelCount);
        self.check_handle("channel_count", handle)?;
        Ok(self.settings.channel_count)
    }

    fn configure_channel(
        &mut self,
        handle: DeviceHandle,
        channel: &ChannelConfig,
    ) -> Result<(), InstrumentError> {
        self.calls.push(SimCall::ConfigureChannel(channel.clone()));
        self.check_handle("configure_channel", handle)?;
        self.channels.retain(|c| c.index != channel.index);
        self.channels.push(channel.clone());
        Ok(())
    }

    fn configure_acquisition(
        &mut self,
        handle: DeviceHandle,
        acq: &AcquisitionConfig,
    ) -> Result<(), InstrumentError> {
        self.calls.push(SimCall::ConfigureAcquisition(acq.clone()));
        self.check_handle("configure_acquisition", handle)?;
        self.acq = acq.clone();
        Ok(())
    }

    fn arm(&mut self, handle: DeviceHandle) -> Result<(), InstrumentError> {
        self.calls.push(SimCall::Arm);
        self.check_handle("arm", handle)?;
        if self.settings.fail_arm {
            return Err(InstrumentError::new("arm", ERC_NOT_SUPPORTED, "arm refused"));
        }
        self.armed = true;
        self.polls = 0;
        // A triggered capture starts on the edge; free-running ones start anywhere.
        self.phase = match self.acq.trigger_source {
            TriggerSource::None => self.rng.random_range(0.0..TAU),
            _ => 0.0,
        };
        Ok(())
    }

    fn status(&mut self, handle: DeviceHandle) -> Result<CaptureStatus, InstrumentError> {
        self.calls.push(SimCall::Status);
        self.check_handle("status", handle)?;
        if !self.armed {
            return Ok(CaptureStatus::Ready);
        }
        self.polls = self.polls.saturating_add(1);
        if self.settings.never_done || self.polls < self.settings.polls_to_done {
            Ok(if self.polls == 1 {
                CaptureStatus::Armed
            } else {
                CaptureStatus::Triggered
            })
        } else {
            Ok(CaptureStatus::Done)
        }
    }

    fn read(
        &mut self,
        handle: DeviceHandle,
        channel: usize,
        dest: &mut [f64],
    ) -> Result<usize, InstrumentError> {
        self.calls.push(SimCall::Read {
            channel,
            len: dest.len(),
        });
        self.check_handle("read", handle)?;
        let exhausted = self
            .settings
            .fail_read_after
            .is_some_and(|limit| self.reads >= limit);
        if self.settings.fail_read || exhausted {
            return Err(InstrumentError::new("read", ERC_NOT_SUPPORTED, "read refused"));
        }
        self.reads += 1;
        let config = self
            .channels
            .iter()
            .find(|c| c.index == channel)
            .cloned()
            .unwrap_or_else(|| ChannelConfig::new(channel, 5.0));
        let valid = self
            .settings
            .valid_samples
            .unwrap_or(self.acq.buffer_size)
            .min(dest.len());
        let rate = self.acq.sample_rate_hz;
        for (i, slot) in dest.iter_mut().take(valid).enumerate() {
            *slot = self.sample(&config, i as f64 / rate);
        }
        Ok(valid)
    }

    fn abort(&mut self, handle: DeviceHandle) -> Result<(), InstrumentError> {
        self.calls.push(SimCall::Abort);
        self.check_handle("abort", handle)?;
        self.armed = false;
        Ok(())
    }
}
