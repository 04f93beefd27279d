//! Explicit run configuration.
//!
//! One value is built in `main` from the command line and handed by reference to
//! the scanner, the writers and the reader. Nothing in the library reads global state.

use std::path::PathBuf;

use crate::compress::Codec;

/// How entries are spread over several output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Balancer {
    /// One bounded hand-off queue; each stream's feeder takes whatever comes next.
    #[default]
    Simple,
    /// Directories go to every stream first, then files are taken from a shared stack.
    Stealing,
}

/// Settings for a create run.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Number of threads scanning directories.
    pub scanners: usize,
    /// Number of reading/compressing worker threads per output stream.
    pub workers: usize,
    /// Read block size in bytes; every body fragment holds at most this many raw bytes.
    pub chunk_size: usize,
    /// Number of output streams (`<output>.<i>` when more than one).
    pub streams: usize,
    pub codec: Codec,
    pub balancer: Balancer,
    /// Remote nodes to delegate writing to; empty means write locally.
    pub hosts: Vec<String>,
    /// Program started on each remote node.
    pub remote_command: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            scanners: 32,
            workers: 32,
            chunk_size: 1024 * 1024,
            streams: 1,
            codec: Codec::None,
            balancer: Balancer::Simple,
            hosts: Vec::new(),
            remote_command: "pfa".to_string(),
        }
    }
}

impl ArchiveConfig {
    /// Replaces zero counts with CPU-derived defaults and clamps the chunk size.
    pub fn normalized(mut self) -> Self {
        if self.scanners == 0 {
            self.scanners = num_cpus::get();
        }
        if self.workers == 0 {
            self.workers = num_cpus::get();
        }
        self.streams = self.streams.max(1);
        self.chunk_size = self.chunk_size.max(1);
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_streams(mut self, streams: usize, balancer: Balancer) -> Self {
        self.streams = streams;
        self.balancer = balancer;
        self
    }
}

/// Settings for list / extract / verify runs.
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// Extraction root. `None` only verifies checksums.
    pub destination: Option<PathBuf>,
    /// Restore permission bits and timestamps on extracted entries.
    pub restore_metadata: bool,
}

impl ReaderOptions {
    pub fn verify_only() -> Self {
        Self { destination: None, restore_metadata: false }
    }

    pub fn extract_to(destination: impl Into<PathBuf>) -> Self {
        Self { destination: Some(destination.into()), restore_metadata: true }
    }
}
