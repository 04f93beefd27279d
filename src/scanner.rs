//! Concurrent directory walker.
//!
//! A fixed pool of threads pulls directory paths off one bounded queue. Each
//! directory is listed once; its non-directory children are recorded first, then
//! its subdirectories are recorded and queued for descent. A counter of
//! outstanding directories signals completion when it drops to zero.
//!
//! Unreadable directories are skipped silently: the archive is partial when
//! permissions are partial.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::common::{archive_path, clean_path, DirEntry};
use crate::error::{PfaError, Result};

/// A directory waiting to be listed, together with the root it was found under.
#[derive(Debug, Clone)]
struct DirTask {
    path: PathBuf,
    root: PathBuf,
    /// Stored form of `root`, attached to every entry found under it.
    floor: Arc<str>,
}

enum ScanTask {
    Dir(DirTask),
    Stop,
}

struct ScanState {
    entries: Mutex<Vec<DirEntry>>,
    total_size: AtomicU64,
    /// Directories queued or being listed.
    outstanding: AtomicUsize,
}

/// Collects an ordered entry list from one or more roots.
#[derive(Debug, Default)]
pub struct Scanner {
    roots: Vec<PathBuf>,
    entries: Vec<DirEntry>,
    total_size: u64,
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a root for the next [`Scanner::start_scan`].
    pub fn add_dir(&mut self, path: impl Into<PathBuf>) {
        self.roots.push(path.into());
    }

    /// Walks every queued root with `concurrency` threads and blocks until done.
    pub fn start_scan(&mut self, concurrency: usize) -> Result<()> {
        let concurrency = concurrency.max(1);
        let state = ScanState {
            entries: Mutex::new(std::mem::take(&mut self.entries)),
            total_size: AtomicU64::new(self.total_size),
            outstanding: AtomicUsize::new(0),
        };

        let mut dir_roots = Vec::new();
        for root in std::mem::take(&mut self.roots) {
            let cleaned = clean_path(&root);
            if cleaned.starts_with("..") {
                warn!("skipping '{}': path is above the working directory", root.display());
                continue;
            }
            let metadata = match fs::symlink_metadata(&cleaned) {
                Ok(m) => m,
                Err(e) => {
                    warn!("skipping '{}': {e}", root.display());
                    continue;
                }
            };
            let floor: Arc<str> = archive_path(&cleaned).into();
            if metadata.is_dir() {
                dir_roots.push(DirTask { path: cleaned.clone(), root: cleaned, floor });
            } else {
                if metadata.file_type().is_file() {
                    state.total_size.fetch_add(metadata.len(), Ordering::Relaxed);
                }
                push_entries(&state, vec![DirEntry::new(cleaned, metadata).with_floor(floor)]);
            }
        }

        if !dir_roots.is_empty() {
            run_pool(&state, dir_roots, concurrency)?;
        }

        self.entries = state
            .entries
            .into_inner()
            .map_err(|_| PfaError::WorkerPanic("scanner entry list poisoned".into()))?;
        self.total_size = state.total_size.load(Ordering::Relaxed);
        info!("scan finished: {} entries, {} bytes", self.entries.len(), self.total_size);
        Ok(())
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<DirEntry> {
        self.entries
    }

    /// Sum of regular-file sizes; directories count as zero.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

fn run_pool(state: &ScanState, roots: Vec<DirTask>, concurrency: usize) -> Result<()> {
    let (task_tx, task_rx) = bounded::<ScanTask>(concurrency);
    let (done_tx, done_rx) = bounded::<()>(1);
    // counted up front so an early finisher cannot see zero while roots are queued
    state.outstanding.store(roots.len(), Ordering::SeqCst);

    thread::scope(|s| {
        let mut handles = Vec::with_capacity(concurrency);
        for i in 0..concurrency {
            let rx = task_rx.clone();
            let tx = task_tx.clone();
            let done = done_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("pfa-scan-{i}"))
                .spawn_scoped(s, move || scan_worker(state, rx, tx, done));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) if handles.is_empty() => {
                    return Err(PfaError::Other(format!("could not spawn scanner thread: {e}")));
                }
                Err(e) => {
                    warn!("scanning with {} threads: {e}", handles.len());
                    break;
                }
            }
        }
        drop(done_tx);

        for root in roots {
            if task_tx.send(ScanTask::Dir(root)).is_err() {
                break;
            }
        }

        // Err here means every worker is gone, which only happens on panic.
        let _ = done_rx.recv();
        for _ in 0..handles.len() {
            let _ = task_tx.send(ScanTask::Stop);
        }

        let mut result = Ok(());
        for handle in handles {
            if handle.join().is_err() {
                result = Err(PfaError::WorkerPanic("scanner thread panicked".into()));
            }
        }
        result
    })
}

fn scan_worker(state: &ScanState, rx: Receiver<ScanTask>, tx: Sender<ScanTask>, done: Sender<()>) {
    let mut backlog: Vec<DirTask> = Vec::new();
    loop {
        let task = match backlog.pop() {
            Some(task) => task,
            None => match rx.recv() {
                Ok(ScanTask::Dir(task)) => task,
                Ok(ScanTask::Stop) | Err(_) => break,
            },
        };
        visit(state, &task, &tx, &mut backlog);
        if state.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = done.try_send(());
        }
    }
}

fn visit(state: &ScanState, task: &DirTask, tx: &Sender<ScanTask>, backlog: &mut Vec<DirTask>) {
    let listing = match fs::read_dir(&task.path) {
        Ok(listing) => listing,
        Err(e) => {
            debug!("cannot list '{}': {e}", task.path.display());
            return;
        }
    };

    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for item in listing.flatten() {
        let path = task.path.join(item.file_name());
        if !within_root(&task.root, &path) {
            warn!("skipping '{}': resolves outside '{}'", path.display(), task.root.display());
            continue;
        }
        let metadata = match item.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!("cannot stat '{}': {e}", path.display());
                continue;
            }
        };
        let entry = DirEntry::new(path, metadata).with_floor(task.floor.clone());
        if entry.is_dir() {
            dirs.push(entry);
        } else {
            files.push(entry);
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    dirs.sort_by(|a, b| a.path.cmp(&b.path));

    let bytes: u64 = files.iter().filter(|e| e.is_file()).map(DirEntry::size).sum();
    state.total_size.fetch_add(bytes, Ordering::Relaxed);

    let subdirs: Vec<PathBuf> = dirs.iter().map(|d| d.path.clone()).collect();
    files.extend(dirs);
    push_entries(state, files);

    for path in subdirs {
        state.outstanding.fetch_add(1, Ordering::AcqRel);
        let next = ScanTask::Dir(DirTask { path, root: task.root.clone(), floor: task.floor.clone() });
        // A full queue must not block: every worker could be stuck here at once.
        if let Err(err) = tx.try_send(next) {
            if let ScanTask::Dir(task) = err.into_inner() {
                backlog.push(task);
            }
        }
    }
}

fn push_entries(state: &ScanState, batch: Vec<DirEntry>) {
    match state.entries.lock() {
        Ok(mut entries) => entries.extend(batch),
        Err(poisoned) => poisoned.into_inner().extend(batch),
    }
}

fn within_root(root: &Path, candidate: &Path) -> bool {
    let cleaned = clean_path(candidate);
    if root == Path::new(".") {
        return !cleaned.starts_with("..");
    }
    cleaned.starts_with(root)
}
