use crate::AcqError;
use confique::Config;
use serde::Deserialize;
use std::{path::Path, time::Duration};

/// Input ranges (peak-to-peak volts) the analog front end can be set to.
pub const ALLOWED_RANGES: [f64; 6] = [0.5, 1.0, 2.0, 5.0, 10.0, 25.0];
pub const MIN_BUFFER_SIZE: usize = 1024;
pub const MAX_BUFFER_SIZE: usize = 16384;
/// Upper bound on the status poll interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Config, Debug, Clone)]
pub struct Conf {
    /// Analog-in channels, one table per channel (`index` is 0-based).
    pub channels: Vec<ChannelConfig>,
    /// Sample rate, buffer size and trigger setup.
    pub acquisition: AcquisitionConfig,
    #[config(nested)]
    pub acq_loop: LoopConf,
    #[config(nested)]
    pub output: OutputConf,
}

#[derive(Config, Debug, Clone)]
pub struct LoopConf {
    /// Delay between status polls while waiting for a capture, in microseconds (max 1000).
    #[config(default = 1000)]
    pub poll_interval_us: u64,
    /// Give up on a capture that has not completed after this many milliseconds.
    #[config(default = 1000)]
    pub timeout_ms: u64,
    /// Re-arm after every capture instead of stopping after one.
    #[config(default = true)]
    pub continuous: bool,
    /// Keep going after a failed cycle in continuous mode.
    #[config(default = false)]
    pub retry_on_error: bool,
    #[config(default = 100)]
    pub retry_delay_ms: u64,
    /// Minimum time between two captures in continuous mode, in milliseconds.
    #[config(default = 100)]
    pub frame_interval_ms: u64,
    /// Captures held for the display before the oldest is dropped.
    #[config(default = 1)]
    pub handoff_capacity: usize,
}

#[derive(Config, Debug, Clone)]
pub struct OutputConf {
    /// Directory CSV captures are written to.
    #[config(env = "SCOPELOOP_OUTPUT_DIR", default = "captures")]
    pub output_dir: String,
}

impl Conf {
    pub fn load(path: &Path) -> Result<Self, confique::Error> {
        Conf::builder().env().file(path).load()
    }
}

impl LoopConf {
    pub fn settings(&self) -> LoopSettings {
        LoopSettings {
            poll_interval: Duration::from_micros(self.poll_interval_us),
            timeout: Duration::from_millis(self.timeout_ms),
            retry_on_error: self.retry_on_error,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            handoff_capacity: self.handoff_capacity,
        }
    }

    pub fn mode(&self) -> AcquisitionMode {
        if self.continuous {
            AcquisitionMode::Continuous
        } else {
            AcquisitionMode::Single
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub index: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_range")]
    pub range_volts: f64,
    #[serde(default)]
    pub offset_volts: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_range() -> f64 {
    5.0
}

impl ChannelConfig {
    pub fn new(index: usize, range_volts: f64) -> Self {
        Self {
            index,
            enabled: true,
            range_volts,
            offset_volts: 0.0,
        }
    }

    pub fn disabled(index: usize) -> Self {
        Self {
            enabled: false,
            ..Self::new(index, default_range())
        }
    }

    /// Lowest and highest voltage the channel can represent.
    pub fn span(&self) -> (f64, f64) {
        let half = self.range_volts / 2.0;
        (self.offset_volts - half, self.offset_volts + half)
    }

    /// Next allowed range up (`steps > 0`) or down, saturating at the ends of the menu.
    pub fn step_range(&self, steps: i32) -> f64 {
        let current = ALLOWED_RANGES
            .iter()
            .position(|&r| (r - self.range_volts).abs() < 1e-9)
            .unwrap_or(3);
        let next = (current as i32 + steps).clamp(0, ALLOWED_RANGES.len() as i32 - 1);
        ALLOWED_RANGES[next as usize]
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    None,
    Channel1,
    Channel2,
    External,
}

impl TriggerSource {
    /// Analog-in channel index the trigger detector watches, if any.
    pub fn channel(self) -> Option<usize> {
        match self {
            TriggerSource::Channel1 => Some(0),
            TriggerSource::Channel2 => Some(1),
            TriggerSource::None | TriggerSource::External => None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEdge {
    Rising,
    Falling,
    Both,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub sample_rate_hz: f64,
    pub buffer_size: usize,
    pub trigger_source: TriggerSource,
    pub trigger_level_volts: f64,
    pub trigger_edge: TriggerEdge,
    /// Capture window in seconds; limits the samples delivered per channel.
    pub time_window_secs: Option<f64>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 1_000_000.0,
            buffer_size: 8192,
            trigger_source: TriggerSource::None,
            trigger_level_volts: 0.0,
            trigger_edge: TriggerEdge::Rising,
            time_window_secs: None,
        }
    }
}

impl AcquisitionConfig {
    /// Samples delivered per channel for one capture, never more than `buffer_size`.
    pub fn samples_per_channel(&self) -> usize {
        match self.time_window_secs {
            Some(window) => {
                let implied = (window * self.sample_rate_hz).round();
                if implied.is_finite() && implied >= 1.0 {
                    (implied as usize).min(self.buffer_size)
                } else {
                    1
                }
            }
            None => self.buffer_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    Single,
    Continuous,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub retry_on_error: bool,
    pub retry_delay: Duration,
    pub frame_interval: Duration,
    pub handoff_capacity: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_interval: MAX_POLL_INTERVAL,
            timeout: Duration::from_secs(1),
            retry_on_error: false,
            retry_delay: Duration::from_millis(100),
            frame_interval: Duration::from_millis(100),
            handoff_capacity: 1,
        }
    }
}

impl LoopSettings {
    pub fn validate(&self) -> Result<(), AcqError> {
        if self.poll_interval.is_zero() || self.poll_interval > MAX_POLL_INTERVAL {
            return Err(AcqError::InvalidParameter(format!(
                "poll interval {:?} must be in (0, {:?}]",
                self.poll_interval, MAX_POLL_INTERVAL
            )));
        }
        if self.timeout.is_zero() {
            return Err(AcqError::InvalidParameter(
                "acquisition timeout must be positive".into(),
            ));
        }
        if self.handoff_capacity == 0 {
            return Err(AcqError::InvalidParameter(
                "handoff capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

pub fn is_allowed_range(range_volts: f64) -> bool {
    ALLOWED_RANGES
        .iter()
        .any(|&r| (r - range_volts).abs() < 1e-9)
}

/// Check a channel/acquisition pair against the device's channel count.
pub fn validate_capture(
    channels: &[ChannelConfig],
    acq: &AcquisitionConfig,
    channel_count: usize,
) -> Result<(), AcqError> {
    let invalid = |msg: String| Err(AcqError::InvalidParameter(msg));

    if !(acq.sample_rate_hz.is_finite() && acq.sample_rate_hz > 0.0) {
        return invalid(format!("sample rate {} Hz", acq.sample_rate_hz));
    }
    if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&acq.buffer_size) {
        return invalid(format!(
            "buffer size {} outside {}..={}",
            acq.buffer_size, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
        ));
    }
    if !acq.trigger_level_volts.is_finite() {
        return invalid("trigger level must be finite".into());
    }
    if let Some(window) = acq.time_window_secs {
        if !(window.is_finite() && window > 0.0) {
            return invalid(format!("time window {window} s"));
        }
    }

    for (i, channel) in channels.iter().enumerate() {
        if channel.index >= channel_count {
            return invalid(format!(
                "channel index {} (device has {} channels)",
                channel.index, channel_count
            ));
        }
        if channels[..i].iter().any(|c| c.index == channel.index) {
            return invalid(format!("channel {} configured twice", channel.index));
        }
        if !is_allowed_range(channel.range_volts) {
            return invalid(format!(
                "range {} V on channel {} (allowed: {:?})",
                channel.range_volts, channel.index, ALLOWED_RANGES
            ));
        }
        if !channel.offset_volts.is_finite() {
            return invalid(format!("offset on channel {}", channel.index));
        }
    }

    if !channels.iter().any(|c| c.enabled) {
        return invalid("no channel enabled".into());
    }
    if let Some(trigger_channel) = acq.trigger_source.channel() {
        let watched = channels
            .iter()
            .any(|c| c.index == trigger_channel && c.enabled);
        if !watched {
            return invalid(format!(
                "trigger source {:?} is not an enabled channel",
                acq.trigger_source
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn two_channels() -> Vec<ChannelConfig> {
        vec![ChannelConfig::new(0, 5.0), ChannelConfig::disabled(1)]
    }

    #[test]
    fn accepts_default_acquisition() {
        assert!(validate_capture(&two_channels(), &AcquisitionConfig::default(), 2).is_ok());
    }

    #[test]
    fn rejects_non_positive_sample_rate() {
        for rate in [0.0, -1.0, f64::NAN] {
            let acq = AcquisitionConfig {
                sample_rate_hz: rate,
                ..Default::default()
            };
            assert!(matches!(
                validate_capture(&two_channels(), &acq, 2),
                Err(AcqError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn rejects_range_outside_menu() {
        let channels = vec![ChannelConfig::new(0, 3.0)];
        assert!(matches!(
            validate_capture(&channels, &AcquisitionConfig::default(), 2),
            Err(AcqError::InvalidParameter(_))
        ));
        for range in ALLOWED_RANGES {
            let channels = vec![ChannelConfig::new(0, range)];
            assert!(validate_capture(&channels, &AcquisitionConfig::default(), 2).is_ok());
        }
    }

    #[test]
    fn rejects_buffer_size_out_of_bounds() {
        for size in [0, 512, 16385] {
            let acq = AcquisitionConfig {
                buffer_size: size,
                ..Default::default()
            };
            assert!(validate_capture(&two_channels(), &acq, 2).is_err());
        }
    }

    #[test]
    fn rejects_bad_channel_sets() {
        let acq = AcquisitionConfig::default();
        let duplicate = vec![ChannelConfig::new(0, 5.0), ChannelConfig::new(0, 1.0)];
        assert!(validate_capture(&duplicate, &acq, 2).is_err());
        let missing = vec![ChannelConfig::new(2, 5.0)];
        assert!(validate_capture(&missing, &acq, 2).is_err());
        let none_enabled = vec![ChannelConfig::disabled(0)];
        assert!(validate_capture(&none_enabled, &acq, 2).is_err());
    }

    #[test]
    fn trigger_must_watch_an_enabled_channel() {
        let acq = AcquisitionConfig {
            trigger_source: TriggerSource::Channel2,
            ..Default::default()
        };
        assert!(validate_capture(&two_channels(), &acq, 2).is_err());

        let acq = AcquisitionConfig {
            trigger_source: TriggerSource::Channel1,
            ..Default::default()
        };
        assert!(validate_capture(&two_channels(), &acq, 2).is_ok());
    }

    #[test]
    fn time_window_limits_samples() {
        let mut acq = AcquisitionConfig {
            sample_rate_hz: 1e6,
            buffer_size: 4096,
            ..Default::default()
        };
        assert_eq!(acq.samples_per_channel(), 4096);
        acq.time_window_secs = Some(1e-3);
        assert_eq!(acq.samples_per_channel(), 1000);
        acq.time_window_secs = Some(1.0);
        assert_eq!(acq.samples_per_channel(), 4096);
    }

    #[test]
    fn range_steps_saturate() {
        let ch = ChannelConfig::new(0, 5.0);
        assert_eq!(ch.step_range(1), 10.0);
        assert_eq!(ch.step_range(-1), 2.0);
        assert_eq!(ch.step_range(10), 25.0);
        assert_eq!(ChannelConfig::new(0, 0.5).step_range(-1), 0.5);
    }

    #[test]
    fn loop_settings_bounds() {
        assert!(LoopSettings::default().validate().is_ok());
        let slow = LoopSettings {
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        };
        assert!(slow.validate().is_err());
        let no_handoff = LoopSettings {
            handoff_capacity: 0,
            ..Default::default()
        };
        assert!(no_handoff.validate().is_err());
    }

    #[test]
    fn loads_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[[channels]]
index = 0
range_volts = 2.0

[[channels]]
index = 1
enabled = false

[acquisition]
sample_rate_hz = 2e6
buffer_size = 4096
trigger_source = "Channel1"
trigger_edge = "Falling"

[acq_loop]
timeout_ms = 250
continuous = false
"#
        )
        .unwrap();

        let conf = Conf::load(file.path()).unwrap();
        assert_eq!(conf.channels.len(), 2);
        assert_eq!(conf.channels[0].range_volts, 2.0);
        assert!(conf.channels[0].enabled);
        assert!(!conf.channels[1].enabled);
        assert_eq!(conf.acquisition.buffer_size, 4096);
        assert_eq!(conf.acquisition.trigger_source, TriggerSource::Channel1);
        assert_eq!(conf.acquisition.trigger_edge, TriggerEdge::Falling);
        assert_eq!(conf.acquisition.trigger_level_volts, 0.0);
        assert_eq!(conf.acq_loop.mode(), AcquisitionMode::Single);

        let settings = conf.acq_loop.settings();
        assert_eq!(settings.timeout, Duration::from_millis(250));
        assert_eq!(settings.poll_interval, Duration::from_millis(1));
        assert!(settings.validate().is_ok());
    }
}
