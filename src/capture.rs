use crate::AcqError;
use ndarray::Array2;

/// One channel of one completed capture, as handed to the display.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub channel_index: usize,
    pub samples: Vec<f64>,
    /// Seconds since the loop was started, taken when the capture was armed.
    pub timestamp_base: f64,
    /// Capture number within the run; shared by every channel of a capture.
    pub sequence: u64,
    pub sample_rate_hz: f64,
}

impl SampleBuffer {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time of sample `i` relative to the start of the capture, in seconds.
    pub fn time_of(&self, i: usize) -> f64 {
        i as f64 / self.sample_rate_hz
    }

    pub fn duration_secs(&self) -> f64 {
        self.time_of(self.samples.len())
    }

    pub fn min_max(&self) -> Option<(f64, f64)> {
        self.samples.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }
}

/// Scratch block the device is read into: one row per enabled channel, each
/// `buffer_size` samples long.
#[derive(Debug)]
pub struct RawCapture {
    pub sequence: u64,
    pub timestamp_base: f64,
    pub sample_rate_hz: f64,
    pub channels: Vec<usize>,
    pub data: Array2<f64>,
    /// Valid samples reported per row.
    pub valid: Vec<usize>,
}

impl RawCapture {
    pub fn new(
        channels: Vec<usize>,
        buffer_size: usize,
        sample_rate_hz: f64,
        sequence: u64,
        timestamp_base: f64,
    ) -> Self {
        let rows = channels.len();
        Self {
            sequence,
            timestamp_base,
            sample_rate_hz,
            channels,
            data: Array2::zeros((rows, buffer_size)),
            valid: vec![0; rows],
        }
    }

    /// Fill every row with `read(channel, row)`, which returns the valid count.
    pub fn fill_with<F>(&mut self, mut read: F) -> Result<(), AcqError>
    where
        F: FnMut(usize, &mut [f64]) -> Result<usize, AcqError>,
    {
        let rows = self
            .data
            .outer_iter_mut()
            .zip(self.channels.iter().zip(self.valid.iter_mut()));
        for (mut row, (&channel, valid)) in rows {
            let n = match row.as_slice_mut() {
                Some(dest) => read(channel, dest)?,
                None => {
                    let mut scratch = row.to_vec();
                    let n = read(channel, &mut scratch)?;
                    row.assign(&ndarray::ArrayView1::from(&scratch[..]));
                    n
                }
            };
            *valid = n.min(row.len());
        }
        Ok(())
    }

    /// Split into per-channel buffers of exactly `samples_per_channel` samples,
    /// truncating long rows and zero-padding short ones.
    pub fn into_buffers(self, samples_per_channel: usize) -> Vec<SampleBuffer> {
        let len = samples_per_channel.min(self.data.ncols());
        self.data
            .outer_iter()
            .zip(self.channels.iter().zip(self.valid.iter()))
            .map(|(row, (&channel_index, &valid))| {
                let mut samples: Vec<f64> = row.iter().take(valid.min(len)).copied().collect();
                samples.resize(len, 0.0);
                SampleBuffer {
                    channel_index,
                    samples,
                    timestamp_base: self.timestamp_base,
                    sequence: self.sequence,
                    sample_rate_hz: self.sample_rate_hz,
                }
            })
            .collect()
    }
}
