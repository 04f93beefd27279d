//! # pfa Core Library
//!
//! A parallel file archiver. Directory trees are walked concurrently, file bodies are
//! compressed by a pool of workers and multiplexed into one or more section-framed
//! streams, and readers demultiplex those streams back into files while checking a
//! CRC-64 per file.
//!
//! ## Key Modules
//!
//! - [`format`]: wire records of the container and their big-endian encoding.
//! - [`scanner`]: bounded-pool directory walker.
//! - [`archive`]: the multi-threaded [`archive::ArchiveWriter`].
//! - [`extract`]: the demultiplexing [`extract::ArchiveReader`].
//! - [`lister`]: header-only inventory of a stream.
//! - [`workers`]: create runs over one or many streams, local or remote.
//!
//! ## Examples
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//! use pfa::config::{ArchiveConfig, ReaderOptions};
//! use pfa::compress::Codec;
//!
//! let config = ArchiveConfig::default().with_codec(Codec::Lz4);
//! pfa::workers::create_archive(&[PathBuf::from("data")], Path::new("data.pfa"), &config)?;
//!
//! let mut reader = pfa::extract::ArchiveReader::new(ReaderOptions::verify_only());
//! reader.add_path("data.pfa")?;
//! assert!(reader.finish()?.is_clean());
//! # Ok::<(), pfa::PfaError>(())
//! ```

pub mod archive;
pub mod checksum;
pub mod cli;
pub mod common;
pub mod compress;
pub mod config;
pub mod error;
pub mod extract;
pub mod format;
pub mod fsx;
pub mod lister;
pub mod progress;
pub mod remote;
pub mod scanner;
pub mod workers;

pub use error::{PfaError, Result};
