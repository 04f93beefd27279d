use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::compress::{Codec, DEFAULT_ZSTD_LEVEL};
use crate::config::{ArchiveConfig, Balancer, ReaderOptions};

#[derive(Parser, Debug)]
#[command(name = "pfa", author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Create an archive from files and directories.
    #[command(alias = "c")]
    Create(CreateArgs),

    /// List the entries of an archive.
    #[command(alias = "l")]
    List(ListArgs),

    /// Extract an archive, or only verify its checksums.
    #[command(alias = "x")]
    Extract(ExtractArgs),
}

#[derive(clap::Args, Clone, Debug)]
pub struct CreateArgs {
    /// Input files or directories.
    #[arg(required_unless_present = "remote_agent")]
    pub inputs: Vec<PathBuf>,

    /// Output archive. With several streams, `<output>.<i>` files are written.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Number of scanner threads. [0 = number of CPUs]
    #[arg(short = 's', long, default_value_t = 32)]
    pub scanners: usize,

    /// Number of writer threads per stream. [0 = number of CPUs]
    #[arg(short = 'r', long, default_value_t = 32)]
    pub workers: usize,

    /// Block size in KiB; each body fragment holds at most one block.
    #[arg(short = 'b', long = "block-size", default_value_t = 1024)]
    pub block_kib: usize,

    /// Number of output streams.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub streams: usize,

    /// Compression applied to every block.
    #[arg(short = 'p', long = "compression", value_enum, default_value_t = CodecArg::None)]
    pub compression: CodecArg,

    /// Zstandard level, used with `-p zstd`.
    #[arg(long, default_value_t = DEFAULT_ZSTD_LEVEL)]
    pub level: i32,

    /// How entries are spread over several streams.
    #[arg(long, value_enum, default_value_t = BalancerArg::Simple)]
    pub balancer: BalancerArg,

    /// Comma-separated hosts; each writes one stream over ssh instead of writing locally.
    #[arg(long, value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// Program started on each remote host.
    #[arg(long, default_value = "pfa")]
    pub remote_command: String,

    /// Read paths from stdin, one per line, instead of scanning.
    #[arg(long, hide = true)]
    pub remote_agent: bool,
}

#[derive(clap::Args, Clone, Debug)]
pub struct ListArgs {
    /// Archive to list; `<input>.<i>` streams are picked up when `<input>` is absent.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Print the inventory as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args, Clone, Debug)]
pub struct ExtractArgs {
    /// Archive to extract; `<input>.<i>` streams are picked up when `<input>` is absent.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Destination directory.
    #[arg(short = 'C', long = "directory", default_value = ".")]
    pub directory: PathBuf,

    /// Only check checksums, write nothing.
    #[arg(long)]
    pub verify_only: bool,
}

#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecArg {
    /// Store blocks unchanged.
    None,
    /// Zstandard.
    Zstd,
    /// LZ4 block format.
    #[value(alias = "snappy")]
    Lz4,
}

#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum BalancerArg {
    /// One hand-off queue shared by all streams.
    Simple,
    /// Directories to every stream, files stolen from a shared stack.
    Stealing,
}

impl CreateArgs {
    pub fn codec(&self) -> Codec {
        match self.compression {
            CodecArg::None => Codec::None,
            CodecArg::Zstd => Codec::Zstd { level: self.level },
            CodecArg::Lz4 => Codec::Lz4,
        }
    }

    pub fn to_config(&self) -> ArchiveConfig {
        ArchiveConfig {
            scanners: self.scanners,
            workers: self.workers,
            chunk_size: self.block_kib.max(1) * 1024,
            streams: self.streams,
            codec: self.codec(),
            balancer: match self.balancer {
                BalancerArg::Simple => Balancer::Simple,
                BalancerArg::Stealing => Balancer::Stealing,
            },
            hosts: self.hosts.iter().filter(|h| !h.is_empty()).cloned().collect(),
            remote_command: self.remote_command.clone(),
        }
        .normalized()
    }
}

impl ExtractArgs {
    pub fn to_options(&self) -> ReaderOptions {
        if self.verify_only {
            ReaderOptions::verify_only()
        } else {
            ReaderOptions::extract_to(&self.directory)
        }
    }
}

/// Parses the command line. Help and version requests come back as errors too;
/// `clap::Error::use_stderr` tells them apart.
pub fn parse() -> Result<Commands, clap::Error> {
    Args::try_parse().map(|args| args.command)
}
