//! # Archive Writer
//!
//! An [`ArchiveWriter`] owns one output stream and a pool of worker threads. Entries
//! are handed to the pool through a queue of depth one, so the caller only runs as
//! fast as reading and compression keep up.
//!
//! Each worker owns one file end to end: it opens the source, takes a fresh file ID,
//! then emits the file header, one body fragment per chunk and finally the footer.
//! Compression happens outside the output lock; the lock is held only while one
//! complete record is written, so fragments of different files interleave freely.
//!
//! Lock order is directory cache, then output. The cache's write lock is held while
//! a directory record is emitted, so a path found in the cache is already on the wire.

use std::collections::HashSet;
use std::fs::{self, File, Metadata};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::checksum::Crc64;
use crate::common::{archive_parent, DirEntry};
use crate::compress::Codec;
use crate::config::ArchiveConfig;
use crate::error::{PfaError, Result};
use crate::format::{body_prefix, footer_record, frame_structured, ArchiveHeader, FileSection, SectionType};
use crate::fsx;
use crate::progress::{StreamMetrics, WriteStats};

/// Anything that accepts scanned entries and eventually produces one archive stream.
pub trait EntrySink: Send {
    fn append(&mut self, entry: DirEntry) -> Result<()>;
    fn close(self: Box<Self>) -> Result<WriteStats>;
}

struct Shared<W> {
    label: String,
    output: Mutex<W>,
    next_id: Mutex<u64>,
    dircache: RwLock<HashSet<String>>,
    codec: Codec,
    chunk_size: usize,
    metrics: StreamMetrics,
    cancelled: AtomicBool,
    first_error: Mutex<Option<PfaError>>,
}

/// Multi-threaded writer for one archive stream.
pub struct ArchiveWriter<W: Write + Send + 'static> {
    shared: Arc<Shared<W>>,
    input: Option<Sender<DirEntry>>,
    workers: Vec<JoinHandle<()>>,
    started: Instant,
}

impl ArchiveWriter<BufWriter<File>> {
    /// Creates `path` and starts a writer on it. Failure to create the file is fatal.
    pub fn create(path: impl AsRef<Path>, config: &ArchiveConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| PfaError::CreateOutput { source, path: path.to_path_buf() })?;
        Self::start(BufWriter::new(file), config, path.display().to_string())
    }
}

impl<W: Write + Send + 'static> ArchiveWriter<W> {
    /// Writes the archive header to `output` and spawns `config.workers` threads.
    pub fn new(output: W, config: &ArchiveConfig) -> Result<Self> {
        Self::start(output, config, "archive".to_string())
    }

    fn start(mut output: W, config: &ArchiveConfig, label: String) -> Result<Self> {
        output
            .write_all(&ArchiveHeader::new(fsx::now_unix()).encode())
            .map_err(|e| PfaError::io(e, &label))?;

        let shared = Arc::new(Shared {
            label,
            output: Mutex::new(output),
            next_id: Mutex::new(1),
            dircache: RwLock::new(HashSet::new()),
            codec: config.codec,
            chunk_size: config.chunk_size.max(1),
            metrics: StreamMetrics::new(),
            cancelled: AtomicBool::new(false),
            first_error: Mutex::new(None),
        });

        let (input, queue) = bounded::<DirEntry>(1);
        let workers = config.workers.max(1);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let shared = Arc::clone(&shared);
            let queue = queue.clone();
            let handle = thread::Builder::new()
                .name(format!("pfa-write-{i}"))
                .spawn(move || worker_loop(&shared, queue))
                .map_err(|e| PfaError::Other(format!("could not spawn writer thread: {e}")))?;
            handles.push(handle);
        }
        info!(
            "writer for {} started: {} workers, chunk {} bytes, codec {}",
            shared.label, workers, shared.chunk_size, shared.codec
        );

        Ok(Self { shared, input: Some(input), workers: handles, started: Instant::now() })
    }

    /// Hands one entry to the worker pool, blocking until a worker takes it.
    pub fn append_file(&self, entry: DirEntry) -> Result<()> {
        if self.shared.cancelled.load(Ordering::Acquire) {
            return Err(PfaError::Other(format!("writer for {} stopped after a fatal error", self.shared.label)));
        }
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| PfaError::Other("writer already closed".into()))?;
        input
            .send(entry)
            .map_err(|_| PfaError::Other(format!("writer for {} has no running workers", self.shared.label)))
    }

    /// Drains the queue, joins every worker and flushes the output.
    pub fn close(mut self) -> Result<WriteStats> {
        self.shutdown()
    }

    /// Like [`ArchiveWriter::close`] but also hands back the underlying output.
    pub fn finish(mut self) -> Result<(W, WriteStats)> {
        let stats = self.shutdown()?;
        let shared = Arc::clone(&self.shared);
        drop(self);
        let shared = Arc::try_unwrap(shared).map_err(|_| PfaError::Other("writer state still shared".into()))?;
        let output = shared
            .output
            .into_inner()
            .map_err(|_| PfaError::WorkerPanic("output lock poisoned".into()))?;
        Ok((output, stats))
    }

    fn shutdown(&mut self) -> Result<WriteStats> {
        self.input.take();
        let mut panicked = false;
        for handle in self.workers.drain(..) {
            panicked |= handle.join().is_err();
        }
        if panicked {
            return Err(PfaError::WorkerPanic(format!("writer thread for {} panicked", self.shared.label)));
        }
        if let Some(err) = lock_slot(&self.shared.first_error).take() {
            return Err(err);
        }
        self.shared
            .with_output(|out| out.flush())?
            .map_err(|e| PfaError::io(e, &self.shared.label))?;

        let stats = self.shared.metrics.snapshot(self.started);
        info!(
            "writer for {} closed: {} files, {} raw bytes, {} stored bytes",
            self.shared.label, stats.files, stats.raw_bytes, stats.compressed_bytes
        );
        Ok(stats)
    }
}

impl<W: Write + Send + 'static> Drop for ArchiveWriter<W> {
    fn drop(&mut self) {
        self.input.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<W: Write + Send + 'static> EntrySink for ArchiveWriter<W> {
    fn append(&mut self, entry: DirEntry) -> Result<()> {
        self.append_file(entry)
    }

    fn close(self: Box<Self>) -> Result<WriteStats> {
        (*self).close()
    }
}

fn worker_loop<W: Write>(shared: &Shared<W>, queue: Receiver<DirEntry>) {
    for entry in queue {
        // keep draining after a failure so the feeder never blocks
        if shared.cancelled.load(Ordering::Acquire) {
            continue;
        }
        if let Err(err) = shared.write_entry(&entry) {
            shared.fail(err);
        }
    }
}

fn lock_slot(slot: &Mutex<Option<PfaError>>) -> std::sync::MutexGuard<'_, Option<PfaError>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<W: Write> Shared<W> {
    fn fail(&self, err: PfaError) {
        warn!("writer for {} stopping: {err}", self.label);
        self.cancelled.store(true, Ordering::Release);
        let mut slot = lock_slot(&self.first_error);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn with_output<T>(&self, f: impl FnOnce(&mut W) -> T) -> Result<T> {
        let mut out = self
            .output
            .lock()
            .map_err(|_| PfaError::WorkerPanic("output lock poisoned".into()))?;
        Ok(f(&mut *out))
    }

    /// Writes one complete record while holding the output lock.
    fn emit(&self, parts: &[&[u8]]) -> Result<()> {
        self.with_output(|out| parts.iter().try_for_each(|part| out.write_all(part)))?
            .map_err(|e| PfaError::io(e, &self.label))
    }

    fn next_file_id(&self) -> Result<u64> {
        let mut next = self
            .next_id
            .lock()
            .map_err(|_| PfaError::WorkerPanic("file id lock poisoned".into()))?;
        let id = *next;
        *next += 1;
        Ok(id)
    }

    /// Errors returned from here concern the output stream; problems with one
    /// source file are logged and the file is skipped.
    fn write_entry(&self, entry: &DirEntry) -> Result<()> {
        let path = entry.archive_path();
        let file_type = entry.metadata.file_type();
        if file_type.is_dir() {
            return self.announce_dir(&path, Some(&entry.metadata), entry.floor.as_deref());
        }
        if !file_type.is_file() {
            let kind = if file_type.is_symlink() { "symbolic link" } else { "special file" };
            warn!("skipping '{path}': unsupported type ({kind})");
            return Ok(());
        }
        if entry.floor.as_deref() != Some(path.as_str()) {
            if let Some(parent) = archive_parent(&path) {
                self.announce_dir(parent, None, entry.floor.as_deref())?;
            }
        }
        self.write_file(entry, path)
    }

    fn is_announced(&self, path: &str) -> Result<bool> {
        let known = self
            .dircache
            .read()
            .map_err(|_| PfaError::WorkerPanic("directory cache poisoned".into()))?;
        Ok(known.contains(path))
    }

    /// Emits a directory record unless one was already written, ancestors first.
    /// The walk upwards stops at `floor`, the scan root, when one is known.
    fn announce_dir(&self, path: &str, metadata: Option<&Metadata>, floor: Option<&str>) -> Result<()> {
        if self.is_announced(path)? {
            return Ok(());
        }
        if floor != Some(path) {
            if let Some(parent) = archive_parent(path) {
                self.announce_dir(parent, None, floor)?;
            }
        }

        let metadata = match metadata {
            Some(m) => m.clone(),
            None => match fs::symlink_metadata(path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("cannot stat directory '{path}': {e}");
                    return Ok(());
                }
            },
        };
        let record = match fsx::describe(path.to_string(), &metadata)
            .encode()
            .and_then(|payload| frame_structured(SectionType::Directory, &payload))
        {
            Ok(record) => record,
            Err(e) => {
                warn!("skipping directory '{path}': {e}");
                return Ok(());
            }
        };

        let mut known = self
            .dircache
            .write()
            .map_err(|_| PfaError::WorkerPanic("directory cache poisoned".into()))?;
        if known.contains(path) {
            return Ok(());
        }
        self.emit(&[&record[..]])?;
        known.insert(path.to_string());
        debug!("directory '{path}' announced");
        Ok(())
    }

    fn write_file(&self, entry: &DirEntry, path: String) -> Result<()> {
        let mut source = match File::open(&entry.path) {
            Ok(file) => file,
            Err(e) => {
                warn!("skipping '{}': {e}", entry.path.display());
                return Ok(());
            }
        };

        let file_id = self.next_file_id()?;
        let section = FileSection {
            file: fsx::describe(path, &entry.metadata),
            size: entry.size(),
            file_id,
            compression: self.codec.tag(),
        };
        let header = match section.encode().and_then(|p| frame_structured(SectionType::File, &p)) {
            Ok(header) => header,
            Err(e) => {
                warn!("skipping '{}': {e}", entry.path.display());
                return Ok(());
            }
        };
        self.emit(&[&header[..]])?;

        let mut crc = Crc64::new();
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return Ok(());
            }
            let n = match fill(&mut source, &mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(
                        "read error on '{}' after {} bytes, closing it early: {e}",
                        entry.path.display(),
                        crc.len()
                    );
                    break;
                }
            };
            let raw = &buf[..n];
            crc.update(raw);
            let packed = self.codec.compress_block(raw)?;
            self.emit(&[&body_prefix(file_id, packed.len() as u64)[..], &*packed])?;
            self.metrics.record_chunk(n as u64, packed.len() as u64);
        }

        self.emit(&[&footer_record(file_id, crc.sum64())[..]])?;
        self.metrics.record_file();
        debug!("file '{}' written as id {file_id}, {} bytes", section.file.path, crc.len());
        Ok(())
    }
}

/// Reads until `buf` is full or the source is exhausted.
fn fill<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Name of the `index`-th stream when a run writes more than one.
pub fn stream_path(output: &Path, index: usize) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Section, SectionReader};
    use crate::common::archive_path;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn config(workers: usize, chunk: usize, codec: Codec) -> ArchiveConfig {
        ArchiveConfig::default().with_workers(workers).with_chunk_size(chunk).with_codec(codec)
    }

    fn sections(bytes: Vec<u8>) -> Vec<Section> {
        let (_, mut reader) = SectionReader::with_archive_header(Cursor::new(bytes)).unwrap();
        let mut out = Vec::new();
        while let Some(section) = reader.next_section().unwrap() {
            out.push(section);
        }
        out
    }

    #[test]
    fn parent_directory_precedes_file() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("f.txt"), b"hello world").unwrap();

        let writer = ArchiveWriter::new(Vec::new(), &config(4, 4, Codec::None)).unwrap();
        writer.append_file(DirEntry::from_path(sub.join("f.txt")).unwrap()).unwrap();
        let (bytes, stats) = writer.finish().unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.raw_bytes, 11);

        let all = sections(bytes);
        let dir_pos = all
            .iter()
            .position(|s| matches!(s, Section::Directory(d) if d.path.ends_with("/sub")))
            .unwrap();
        let file_pos = all.iter().position(|s| matches!(s, Section::File(_))).unwrap();
        assert!(dir_pos < file_pos);
        // 11 bytes in chunks of 4
        let bodies = all.iter().filter(|s| matches!(s, Section::FileBody { .. })).count();
        assert_eq!(bodies, 3);
        assert!(matches!(all.last(), Some(Section::FileFooter(_))));
    }

    #[test]
    fn ancestors_above_the_scan_root_are_not_announced() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("f.txt"), b"x").unwrap();
        let floor: std::sync::Arc<str> = archive_path(dir.path()).into();

        let writer = ArchiveWriter::new(Vec::new(), &config(2, 16, Codec::None)).unwrap();
        let entry = DirEntry::from_path(sub.join("f.txt")).unwrap().with_floor(floor.clone());
        writer.append_file(entry).unwrap();
        let (bytes, _) = writer.finish().unwrap();

        let dirs: Vec<String> = sections(bytes)
            .into_iter()
            .filter_map(|s| match s {
                Section::Directory(d) => Some(d.path),
                _ => None,
            })
            .collect();
        assert_eq!(dirs, vec![floor.to_string(), format!("{floor}/sub")]);
    }

    #[test]
    fn concurrent_files_get_distinct_ids() {
        let dir = tempdir().unwrap();
        let writer = ArchiveWriter::new(Vec::new(), &config(8, 16, Codec::Lz4)).unwrap();
        for i in 0..50 {
            let path = dir.path().join(format!("f{i}"));
            fs::write(&path, vec![b'a' + (i % 26) as u8; 100 + i]).unwrap();
            writer.append_file(DirEntry::from_path(&path).unwrap()).unwrap();
        }
        let (bytes, stats) = writer.finish().unwrap();
        assert_eq!(stats.files, 50);

        let mut ids: Vec<u64> = sections(bytes)
            .into_iter()
            .filter_map(|s| match s {
                Section::File(f) => Some(f.file_id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn vanished_source_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone");
        fs::write(&path, b"soon gone").unwrap();
        let entry = DirEntry::from_path(&path).unwrap();
        fs::remove_file(&path).unwrap();

        let writer = ArchiveWriter::new(Vec::new(), &config(2, 64, Codec::None)).unwrap();
        writer.append_file(entry).unwrap();
        let (bytes, stats) = writer.finish().unwrap();
        assert_eq!(stats.files, 0);
        assert!(!sections(bytes).iter().any(|s| matches!(s, Section::File(_))));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("real"), b"x").unwrap();
        std::os::unix::fs::symlink("real", dir.path().join("link")).unwrap();
        let writer = ArchiveWriter::new(Vec::new(), &config(2, 64, Codec::None)).unwrap();
        writer.append_file(DirEntry::from_path(dir.path().join("link")).unwrap()).unwrap();
        let stats = writer.close().unwrap();
        assert_eq!(stats.files, 0);
    }

    struct Failing {
        budget: usize,
    }

    impl Write for Failing {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget < buf.len() {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.budget -= buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn output_failure_is_returned_from_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big");
        fs::write(&path, vec![7u8; 4096]).unwrap();
        let writer = ArchiveWriter::new(Failing { budget: 256 }, &config(2, 512, Codec::None)).unwrap();
        writer.append_file(DirEntry::from_path(&path).unwrap()).unwrap();
        let err = writer.close().unwrap_err();
        assert!(matches!(err, PfaError::Io { .. }), "{err}");
    }

    #[test]
    fn stream_paths_are_numbered() {
        assert_eq!(stream_path(Path::new("/tmp/out.pfa"), 3), PathBuf::from("/tmp/out.pfa.3"));
    }
}
