//! Delegating a stream to another node.
//!
//! The local side starts `ssh <host> <remote_command> create --remote-agent ...`
//! and writes one absolute path per line to the child's stdin. The agent on the
//! other end reads those lines and appends each path to an ordinary local writer.
//! Closing stdin ends the agent; its exit status is the stream's verdict.

use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::archive::{ArchiveWriter, EntrySink};
use crate::common::{clean_path, DirEntry};
use crate::compress::Codec;
use crate::config::ArchiveConfig;
use crate::error::{PfaError, Result};
use crate::progress::WriteStats;

/// Arguments handed to the remote program for one output stream.
pub fn agent_args(output: &Path, config: &ArchiveConfig) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--remote-agent".to_string(),
        "-o".to_string(),
        output.display().to_string(),
        "-b".to_string(),
        (config.chunk_size / 1024).max(1).to_string(),
        "-r".to_string(),
        config.workers.to_string(),
        "-p".to_string(),
        config.codec.name().to_string(),
    ];
    if let Codec::Zstd { level } = config.codec {
        args.push("--level".to_string());
        args.push(level.to_string());
    }
    args
}

/// Sink that forwards entry paths to a remote agent.
pub struct RemoteSink {
    host: String,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    started: Instant,
    files: u64,
    raw_bytes: u64,
}

impl RemoteSink {
    /// Starts the agent for `output` on `host` over ssh.
    pub fn spawn(host: &str, output: &Path, config: &ArchiveConfig) -> Result<Self> {
        Self::with_transport("ssh", host, output, config)
    }

    /// Like [`RemoteSink::spawn`] with another transport program in place of `ssh`.
    pub fn with_transport(transport: &str, host: &str, output: &Path, config: &ArchiveConfig) -> Result<Self> {
        let mut child = Command::new(transport)
            .arg(host)
            .arg(&config.remote_command)
            .args(agent_args(output, config))
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| PfaError::Remote { host: host.to_string(), message: format!("cannot start {transport}: {e}") })?;
        let stdin = child
            .stdin
            .take()
            .map(BufWriter::new)
            .ok_or_else(|| PfaError::Remote { host: host.to_string(), message: "no stdin pipe".into() })?;
        info!("remote stream {} started on {host}", output.display());
        Ok(Self { host: host.to_string(), child, stdin: Some(stdin), started: Instant::now(), files: 0, raw_bytes: 0 })
    }

    fn remote_error(&self, message: impl Into<String>) -> PfaError {
        PfaError::Remote { host: self.host.clone(), message: message.into() }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(clean_path(path));
    }
    let cwd = std::env::current_dir()?;
    Ok(clean_path(&cwd.join(path)))
}

impl EntrySink for RemoteSink {
    fn append(&mut self, entry: DirEntry) -> Result<()> {
        let path = absolute(&entry.path)?;
        let Some(line) = path.to_str() else {
            warn!("skipping '{}': path is not valid UTF-8", path.display());
            return Ok(());
        };
        if line.contains('\n') {
            warn!("skipping '{}': path contains a newline", path.display());
            return Ok(());
        }
        let stdin = self.stdin.as_mut().ok_or_else(|| PfaError::Other("remote sink already closed".into()))?;
        writeln!(stdin, "{line}").map_err(|e| PfaError::Remote { host: self.host.clone(), message: e.to_string() })?;
        if entry.is_file() {
            self.files += 1;
            self.raw_bytes += entry.size();
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<WriteStats> {
        let flushed = match self.stdin.take() {
            Some(mut stdin) => stdin.flush(),
            None => Ok(()),
        };
        let status = self.child.wait().map_err(|e| self.remote_error(e.to_string()))?;
        if !status.success() {
            return Err(self.remote_error(format!("agent exited with {status}")));
        }
        flushed.map_err(|e| self.remote_error(e.to_string()))?;
        debug!("remote stream on {} finished", self.host);
        Ok(WriteStats {
            files: self.files,
            elapsed: self.started.elapsed(),
            raw_bytes: self.raw_bytes,
            compressed_bytes: 0,
        })
    }
}

/// Runs the agent side: reads newline-separated paths from `input` and archives them to `output`.
pub fn run_remote_agent<R: BufRead>(input: R, output: &Path, config: &ArchiveConfig) -> Result<WriteStats> {
    let config = config.clone().normalized();
    let writer = ArchiveWriter::create(output, &config)?;
    for line in input.lines() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        match DirEntry::from_path(line) {
            Ok(entry) => writer.append_file(entry)?,
            Err(e) => warn!("skipping '{line}': {e}"),
        }
    }
    writer.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Section, SectionReader};
    use std::fs;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn agent_arguments_carry_the_stream_settings() {
        let config = ArchiveConfig::default()
            .with_workers(4)
            .with_chunk_size(256 * 1024)
            .with_codec(Codec::Zstd { level: 7 });
        let args = agent_args(Path::new("/data/out.pfa.2"), &config);
        assert_eq!(
            args,
            ["create", "--remote-agent", "-o", "/data/out.pfa.2", "-b", "256", "-r", "4", "-p", "zstd", "--level", "7"]
        );
    }

    #[test]
    fn agent_archives_listed_paths() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"file A").unwrap();
        fs::write(&b, b"File B").unwrap();
        let input = format!("{}\n\n{}\n{}\n", a.display(), dir.path().join("missing").display(), b.display());
        let output = dir.path().join("agent.pfa");

        let stats = run_remote_agent(Cursor::new(input), &output, &ArchiveConfig::default().with_workers(2)).unwrap();
        assert_eq!(stats.files, 2);

        let (_, mut reader) = SectionReader::with_archive_header(fs::File::open(&output).unwrap()).unwrap();
        let mut files = 0;
        while let Some(section) = reader.next_section().unwrap() {
            if matches!(section, Section::File(_)) {
                files += 1;
            }
        }
        assert_eq!(files, 2);
    }

    #[cfg(unix)]
    #[test]
    fn failing_agent_is_reported() {
        let sink = RemoteSink::with_transport("false", "nowhere", Path::new("x.pfa"), &ArchiveConfig::default()).unwrap();
        let err = Box::new(sink).close().unwrap_err();
        assert!(matches!(err, PfaError::Remote { ref host, .. } if host == "nowhere"));
    }

    #[cfg(unix)]
    #[test]
    fn succeeding_agent_returns_stats() {
        let sink = RemoteSink::with_transport("true", "somewhere", Path::new("x.pfa"), &ArchiveConfig::default()).unwrap();
        let stats = Box::new(sink).close().unwrap();
        assert_eq!(stats.files, 0);
    }
}
