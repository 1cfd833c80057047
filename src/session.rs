use crate::{
    config::validate_capture, AcqError, AcquisitionConfig, CaptureStatus, ChannelConfig,
    DeviceHandle, DeviceInfo, Instrument, RawCapture, SampleBuffer,
};
use log::{debug, info, warn};

/// An open connection to one instrument.
///
/// A session starts closed ([`DeviceSession::new`]) or is opened right away
/// ([`DeviceSession::open`]). It tracks whether a capture is armed so that at
/// most one acquisition is in flight, and refuses configuration while one is.
pub struct DeviceSession<I: Instrument> {
    instrument: I,
    handle: DeviceHandle,
    info: Option<DeviceInfo>,
    channel_count: usize,
    in_flight: bool,
    configured: Option<(Vec<ChannelConfig>, AcquisitionConfig)>,
}

impl<I: Instrument> DeviceSession<I> {
    pub fn new(instrument: I) -> Self {
        Self {
            instrument,
            handle: DeviceHandle::NONE,
            info: None,
            channel_count: 0,
            in_flight: false,
            configured: None,
        }
    }

    /// Open the first enumerated device.
    pub fn open(instrument: I) -> Result<Self, AcqError> {
        let mut session = Self::new(instrument);
        session.connect()?;
        Ok(session)
    }

    pub fn connect(&mut self) -> Result<(), AcqError> {
        if self.is_open() {
            return Ok(());
        }
        let devices = self.instrument.device_count()?;
        if devices == 0 {
            return Err(AcqError::DeviceNotFound);
        }
        let info = self.instrument.device_info(0).ok();

        let handle = self
            .instrument
            .open(0)
            .map_err(|e| AcqError::DeviceOpenFailed(e.to_string()))?;
        if !handle.is_valid() {
            return Err(AcqError::DeviceOpenFailed(format!(
                "invalid handle {}",
                handle.0
            )));
        }
        self.handle = handle;

        match self.instrument.channel_count(handle) {
            Ok(n) => self.channel_count = n,
            Err(e) => {
                self.close();
                return Err(AcqError::DeviceOpenFailed(e.to_string()));
            }
        }
        self.info = info;
        self.log_parameters();
        Ok(())
    }

    fn log_parameters(&self) {
        let mut param_log = format!("handle: {}\nchannels: {}", self.handle.0, self.channel_count);
        if let Some(info) = &self.info {
            param_log.push_str(&format!(
                "\nname: {}\nserial: {}\nlibrary: {}",
                info.name, info.serial, info.library_version
            ));
        }
        info!("Device {} opened:\n{}", self.device_index(), param_log);
    }

    fn device_index(&self) -> usize {
        self.info.as_ref().map_or(0, |i| i.index)
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_valid()
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn is_armed(&self) -> bool {
        self.in_flight
    }

    /// Last configuration applied with [`configure`](Self::configure).
    pub fn configuration(&self) -> Option<(&[ChannelConfig], &AcquisitionConfig)> {
        self.configured
            .as_ref()
            .map(|(channels, acq)| (channels.as_slice(), acq))
    }

    pub fn configure(
        &mut self,
        channels: &[ChannelConfig],
        acq: &AcquisitionConfig,
    ) -> Result<(), AcqError> {
        if !self.is_open() {
            return Err(AcqError::SessionNotOpen);
        }
        if self.in_flight {
            return Err(AcqError::CaptureInFlight);
        }
        validate_capture(channels, acq, self.channel_count)?;

        for channel in channels {
            self.instrument.configure_channel(self.handle, channel)?;
        }
        self.instrument.configure_acquisition(self.handle, acq)?;
        debug!(
            "Configured {} channel(s) at {} Hz, {} samples",
            channels.iter().filter(|c| c.enabled).count(),
            acq.sample_rate_hz,
            acq.buffer_size
        );
        self.configured = Some((channels.to_vec(), acq.clone()));
        Ok(())
    }

    pub fn arm(&mut self) -> Result<(), AcqError> {
        if !self.is_open() {
            return Err(AcqError::SessionNotOpen);
        }
        if self.in_flight {
            return Err(AcqError::CaptureInFlight);
        }
        self.instrument
            .arm(self.handle)
            .map_err(AcqError::ArmFailed)?;
        self.in_flight = true;
        Ok(())
    }

    pub fn status(&mut self) -> Result<CaptureStatus, AcqError> {
        if !self.is_open() {
            return Err(AcqError::SessionNotOpen);
        }
        Ok(self.instrument.status(self.handle)?)
    }

    /// Read the finished capture: one buffer per enabled channel, in channel
    /// order. Requests `buffer_size` samples per channel and delivers the
    /// count implied by the time window. Clears the in-flight flag.
    pub fn read_capture(
        &mut self,
        sequence: u64,
        timestamp_base: f64,
    ) -> Result<Vec<SampleBuffer>, AcqError> {
        if !self.is_open() {
            return Err(AcqError::SessionNotOpen);
        }
        let Some((channels, acq)) = self.configured.as_ref() else {
            return Err(AcqError::InvalidParameter(
                "session has not been configured".into(),
            ));
        };
        let mut enabled: Vec<usize> = channels
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.index)
            .collect();
        enabled.sort_unstable();
        let samples_per_channel = acq.samples_per_channel();
        let mut raw = RawCapture::new(
            enabled,
            acq.buffer_size,
            acq.sample_rate_hz,
            sequence,
            timestamp_base,
        );

        let handle = self.handle;
        let instrument = &mut self.instrument;
        let result = raw.fill_with(|channel, dest| {
            instrument
                .read(handle, channel, dest)
                .map_err(AcqError::ReadFailed)
        });
        if let Err(e) = result {
            self.abort();
            return Err(e);
        }
        self.in_flight = false;
        Ok(raw.into_buffers(samples_per_channel))
    }

    /// Cancel an armed capture. No-op when nothing is in flight.
    pub fn abort(&mut self) {
        if !self.in_flight {
            return;
        }
        if let Err(e) = self.instrument.abort(self.handle) {
            warn!("Abort on handle {} failed: {}", self.handle.0, e);
        }
        self.in_flight = false;
    }

    /// Release the device. Safe to call on a closed session.
    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }
        self.abort();
        self.instrument.close(self.handle);
        info!("Device {} closed", self.device_index());
        self.handle = DeviceHandle::NONE;
        self.configured = None;
    }
}

impl<I: Instrument> Drop for DeviceSession<I> {
    fn drop(&mut self) {
        self.close();
    }
}
