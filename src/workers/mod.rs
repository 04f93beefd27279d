//! Create orchestration: scan the inputs, then feed one or many sinks.
//!
//! With one stream everything goes through a single writer. With several, each
//! stream gets its own writer (or remote node) and entries are spread either
//! through a bounded hand-off queue or by work stealing from a shared stack.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use crossbeam_channel::bounded;
use tracing::{info, warn};

use crate::archive::{stream_path, ArchiveWriter, EntrySink};
use crate::common::DirEntry;
use crate::config::{ArchiveConfig, Balancer};
use crate::error::{PfaError, Result};
use crate::progress::{CreateSummary, WriteStats};
use crate::remote::RemoteSink;
use crate::scanner::Scanner;

/// Scans `inputs` and writes them to `output` (or `output.<i>` per stream).
pub fn create_archive(inputs: &[PathBuf], output: &Path, config: &ArchiveConfig) -> Result<CreateSummary> {
    let config = config.clone().normalized();

    let started = Instant::now();
    let mut scanner = Scanner::new();
    for input in inputs {
        scanner.add_dir(input);
    }
    scanner.start_scan(config.scanners)?;
    let scan_time = started.elapsed();
    let scanned_bytes = scanner.total_size();
    let entries = scanner.into_entries();
    info!("scanned {} entries ({scanned_bytes} bytes) in {:?}", entries.len(), scan_time);

    let summary = CreateSummary { scanned_entries: entries.len(), scanned_bytes, scan_time, streams: Vec::new() };
    let streams = write_entries(entries, output, &config)?;
    Ok(CreateSummary { streams, ..summary })
}

/// Writes an already scanned entry list according to `config`.
pub fn write_entries(entries: Vec<DirEntry>, output: &Path, config: &ArchiveConfig) -> Result<Vec<WriteStats>> {
    let sinks = open_sinks(output, config)?;
    if sinks.len() == 1 {
        if let Some(sink) = sinks.into_iter().next() {
            return collect_stats(vec![feed(sink, entries)]);
        }
        return Err(PfaError::Other("no output sink".into()));
    }
    let results = match (config.hosts.is_empty(), config.balancer) {
        (true, Balancer::Stealing) => run_stealing(sinks, entries),
        _ => run_simple(sinks, entries),
    };
    collect_stats(results)
}

fn open_sinks(output: &Path, config: &ArchiveConfig) -> Result<Vec<Box<dyn EntrySink>>> {
    let mut sinks: Vec<Box<dyn EntrySink>> = Vec::new();
    if !config.hosts.is_empty() {
        for (i, host) in config.hosts.iter().enumerate() {
            sinks.push(Box::new(RemoteSink::spawn(host, &stream_path(output, i), config)?));
        }
    } else if config.streams <= 1 {
        sinks.push(Box::new(ArchiveWriter::create(output, config)?));
    } else {
        for i in 0..config.streams {
            sinks.push(Box::new(ArchiveWriter::create(stream_path(output, i), config)?));
        }
    }
    Ok(sinks)
}

/// Appends every entry, then closes. A close error wins over the append error
/// that it usually explains.
fn feed(mut sink: Box<dyn EntrySink>, entries: impl IntoIterator<Item = DirEntry>) -> Result<WriteStats> {
    let mut append_error = None;
    for entry in entries {
        if let Err(e) = sink.append(entry) {
            append_error = Some(e);
            break;
        }
    }
    let closed = sink.close();
    match append_error {
        Some(e) => Err(closed.err().unwrap_or(e)),
        None => closed,
    }
}

/// Every stream's consumer takes whatever entry comes next from one queue of depth one.
fn run_simple(sinks: Vec<Box<dyn EntrySink>>, entries: Vec<DirEntry>) -> Vec<Result<WriteStats>> {
    let (tx, rx) = bounded::<DirEntry>(1);
    thread::scope(|s| {
        let handles: Vec<_> = sinks
            .into_iter()
            .map(|sink| {
                let rx = rx.clone();
                s.spawn(move || feed(sink, rx))
            })
            .collect();
        drop(rx);

        for entry in entries {
            if tx.send(entry).is_err() {
                warn!("every output stream stopped, dropping remaining entries");
                break;
            }
        }
        drop(tx);
        join_all(handles)
    })
}

/// Directories go to every stream so each one extracts on its own; files are
/// popped from a shared stack by whichever stream is free.
fn run_stealing(sinks: Vec<Box<dyn EntrySink>>, entries: Vec<DirEntry>) -> Vec<Result<WriteStats>> {
    let (directories, mut files): (Vec<_>, Vec<_>) = entries.into_iter().partition(DirEntry::is_dir);
    files.reverse();
    let stack = Mutex::new(files);
    let directories = &directories;
    let stack = &stack;

    thread::scope(|s| {
        let handles: Vec<_> = sinks
            .into_iter()
            .map(|sink| {
                s.spawn(move || {
                    let stolen = std::iter::from_fn(|| match stack.lock() {
                        Ok(mut files) => files.pop(),
                        Err(poisoned) => poisoned.into_inner().pop(),
                    });
                    feed(sink, directories.iter().cloned().chain(stolen))
                })
            })
            .collect();
        join_all(handles)
    })
}

fn join_all(handles: Vec<thread::ScopedJoinHandle<'_, Result<WriteStats>>>) -> Vec<Result<WriteStats>> {
    handles
        .into_iter()
        .map(|h| h.join().unwrap_or_else(|_| Err(PfaError::WorkerPanic("stream feeder panicked".into()))))
        .collect()
}

/// All stream stats, or the most severe error among them.
fn collect_stats(results: Vec<Result<WriteStats>>) -> Result<Vec<WriteStats>> {
    let mut stats = Vec::with_capacity(results.len());
    let mut failure: Option<PfaError> = None;
    for result in results {
        match result {
            Ok(s) => stats.push(s),
            Err(e) => {
                let replace = match &failure {
                    None => true,
                    Some(current) => e.is_fatal() && !current.is_fatal(),
                };
                if replace {
                    failure = Some(e);
                }
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}
