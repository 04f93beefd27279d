//! Throughput accounting for archive operations
//!
//! Writer workers bump shared atomic counters (no lock on the hot path); the
//! totals are turned into [`WriteStats`] when a stream is closed, and into the
//! printed summary lines after a create run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by all workers of one output stream.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    /// Files whose footer has been written.
    pub files: AtomicU64,
    /// Uncompressed bytes read from sources.
    pub raw_bytes: AtomicU64,
    /// Body bytes written after compression.
    pub compressed_bytes: AtomicU64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one framed chunk (zero-overhead atomic increment)
    pub fn record_chunk(&self, raw: u64, compressed: u64) {
        self.raw_bytes.fetch_add(raw, Ordering::Relaxed);
        self.compressed_bytes.fetch_add(compressed, Ordering::Relaxed);
    }

    pub fn record_file(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, started: Instant) -> WriteStats {
        WriteStats {
            files: self.files.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
            raw_bytes: self.raw_bytes.load(Ordering::Relaxed),
            compressed_bytes: self.compressed_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Result of closing one writer: number of files, elapsed time, raw and compressed bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WriteStats {
    pub files: u64,
    pub elapsed: Duration,
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
}

impl WriteStats {
    /// Compressed output rate in MiB/s.
    pub fn throughput_mib(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.compressed_bytes as f64 / secs / (1024.0 * 1024.0)
    }

    /// Compressed size as a percentage of the raw size.
    pub fn ratio_percent(&self) -> f64 {
        if self.raw_bytes == 0 {
            return 100.0;
        }
        self.compressed_bytes as f64 / self.raw_bytes as f64 * 100.0
    }

    /// Adds another stream's numbers; elapsed is the longest of the two.
    pub fn merge(&mut self, other: &WriteStats) {
        self.files += other.files;
        self.raw_bytes += other.raw_bytes;
        self.compressed_bytes += other.compressed_bytes;
        self.elapsed = self.elapsed.max(other.elapsed);
    }

    pub fn summary_lines(&self, compressing: bool) -> Vec<String> {
        let mut lines = vec![format!(
            "written {} files in {:.1} seconds with {:.2} MB/s.",
            self.files,
            self.elapsed.as_secs_f64(),
            self.throughput_mib()
        )];
        if compressing {
            lines.push(format!("{:.6}% compression.", self.ratio_percent()));
        }
        lines
    }
}

/// Everything a create run reports back to the front-end.
#[derive(Debug, Clone, Default)]
pub struct CreateSummary {
    pub scanned_entries: usize,
    pub scanned_bytes: u64,
    pub scan_time: Duration,
    /// One entry per output stream, in stream order.
    pub streams: Vec<WriteStats>,
}

impl CreateSummary {
    pub fn scan_line(&self) -> String {
        let secs = self.scan_time.as_secs_f64();
        let rate = if secs > 0.0 { self.scanned_entries as f64 / secs } else { 0.0 };
        format!("scanned {} entries in {:.1} seconds, {:.2} files/s.", self.scanned_entries, secs, rate)
    }

    pub fn total(&self) -> WriteStats {
        let mut total = WriteStats::default();
        for s in &self.streams {
            total.merge(s);
        }
        total
    }
}
