use crate::SampleBuffer;
use anyhow::{anyhow, Result};
use log::info;
use std::{
    fs::{self, DirEntry},
    io::Write,
    path::{Path, PathBuf},
};

/// Writes captures as numbered CSV files (`capture<N>.csv`) in one directory.
pub struct CaptureWriter {
    dir: PathBuf,
}

impl CaptureWriter {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one capture to the next free file and return its path.
    pub fn write(&self, capture: &[SampleBuffer]) -> Result<PathBuf> {
        let path = self.next_file()?;
        let file = fs::File::create(&path)?;
        write_capture(file, capture)?;
        info!(
            "Wrote capture {} to {}",
            capture.first().map_or(0, |b| b.sequence),
            path.display()
        );
        Ok(path)
    }

    fn next_file(&self) -> Result<PathBuf> {
        let entries: Vec<DirEntry> = fs::read_dir(&self.dir)?.filter_map(|e| e.ok()).collect();
        let next = entries
            .iter()
            .filter_map(|entry| {
                entry.file_name().to_str().and_then(|name| {
                    name.strip_prefix("capture")?
                        .strip_suffix(".csv")?
                        .parse::<usize>()
                        .ok()
                })
            })
            .max()
            .map_or(0, |max| max + 1);
        Ok(self.dir.join(format!("capture{next}.csv")))
    }
}

/// One row per sample: `time_s` followed by one `ch<N>_v` column per buffer.
pub fn write_capture<W: Write>(out: W, capture: &[SampleBuffer]) -> Result<()> {
    let first = capture
        .first()
        .ok_or_else(|| anyhow!("capture has no channels"))?;
    let rows = capture.iter().map(SampleBuffer::len).max().unwrap_or(0);

    let mut wtr = csv::Writer::from_writer(out);
    let mut header = vec!["time_s".to_string()];
    header.extend(capture.iter().map(|b| format!("ch{}_v", b.channel_index + 1)));
    wtr.write_record(&header)?;

    for i in 0..rows {
        let mut record = Vec::with_capacity(capture.len() + 1);
        record.push(first.time_of(i).to_string());
        for buffer in capture {
            record.push(buffer.samples.get(i).map_or(String::new(), f64::to_string));
        }
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}
