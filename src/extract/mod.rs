//! # Archive Reader
//!
//! Every input stream gets one dispatcher thread. The dispatcher reads sections in
//! wire order and keeps an in-flight table keyed by file ID: a file header opens an
//! entry and starts a worker for that file, body fragments are routed to the
//! worker's channel, and the footer closes the channel, collects the worker's CRC
//! and retires the entry.
//!
//! Workers decompress, checksum and (when extracting) write their file. A worker
//! that hits a decode or write error keeps draining its channel, so the dispatcher
//! never stalls on it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::checksum::Crc64;
use crate::common::safe_relative;
use crate::compress::Codec;
use crate::config::ReaderOptions;
use crate::error::{IntegrityIssue, IssueKind, PfaError, Result};
use crate::format::{DirectorySection, FileSection, Section, SectionReader, SoftLinkSection};
use crate::fsx;

/// What one per-file worker hands back when its channel is closed.
#[derive(Debug)]
struct FileResult {
    crc: u64,
    bytes: u64,
    problem: Option<IssueKind>,
}

/// One open file between its header and its footer.
struct InFlight {
    bodies: Sender<Vec<u8>>,
    worker: JoinHandle<FileResult>,
    section: FileSection,
    destination: Option<PathBuf>,
}

/// Totals for a single stream.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub name: String,
    pub files: u64,
    pub directories: u64,
    pub softlinks: u64,
    pub bytes: u64,
    pub issues: Vec<IntegrityIssue>,
    /// In-flight entries still open when the stream ended. Zero for a well-formed stream.
    pub leaked: usize,
    /// Extracted directories whose metadata is applied once every stream is done.
    directories_to_restore: Vec<(PathBuf, DirectorySection)>,
}

impl StreamOutcome {
    fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    fn report(&mut self, file_id: u64, path: &str, kind: IssueKind) {
        let issue = IntegrityIssue { stream: self.name.clone(), file_id, path: path.to_string(), kind };
        match issue.kind {
            IssueKind::CrcMismatch { .. } | IssueKind::MissingFooter => error!("{issue}"),
            _ => warn!("{issue}"),
        }
        self.issues.push(issue);
    }
}

/// Aggregate result of [`ArchiveReader::finish`].
#[derive(Debug, Default)]
pub struct ReadReport {
    pub streams: usize,
    pub files: u64,
    pub directories: u64,
    pub softlinks: u64,
    pub bytes: u64,
    pub issues: Vec<IntegrityIssue>,
}

impl ReadReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    fn absorb(&mut self, outcome: StreamOutcome) {
        self.streams += 1;
        self.files += outcome.files;
        self.directories += outcome.directories;
        self.softlinks += outcome.softlinks;
        self.bytes += outcome.bytes;
        self.issues.extend(outcome.issues);
    }

    pub fn summary_line(&self) -> String {
        format!(
            "read {} streams: {} files, {} directories, {} links, {} bytes, {} problems.",
            self.streams,
            self.files,
            self.directories,
            self.softlinks,
            self.bytes,
            self.issues.len()
        )
    }
}

/// Reads one or more streams concurrently.
pub struct ArchiveReader {
    options: Arc<ReaderOptions>,
    streams: Vec<(String, JoinHandle<Result<StreamOutcome>>)>,
}

impl ArchiveReader {
    pub fn new(options: ReaderOptions) -> Self {
        Self { options: Arc::new(options), streams: Vec::new() }
    }

    /// Schedules `stream` for processing on its own dispatcher thread.
    pub fn add_file<R: Read + Send + 'static>(&mut self, stream: R, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        let options = Arc::clone(&self.options);
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(format!("pfa-read-{}", self.streams.len()))
            .spawn(move || read_stream(stream, &thread_name, &options))
            .map_err(|e| PfaError::Other(format!("could not spawn reader thread: {e}")))?;
        self.streams.push((name, handle));
        Ok(())
    }

    pub fn add_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PfaError::io(e, path))?;
        self.add_file(BufReader::new(file), path.display().to_string())
    }

    /// Waits for every scheduled stream. The first fatal stream error is returned
    /// after all dispatchers have been joined.
    pub fn finish(self) -> Result<ReadReport> {
        let mut report = ReadReport::default();
        let mut first_error = None;
        let mut directories = Vec::new();

        for (name, handle) in self.streams {
            match handle.join() {
                Ok(Ok(mut outcome)) => {
                    info!("{name}: {} files, {} bytes", outcome.files, outcome.bytes);
                    directories.append(&mut outcome.directories_to_restore);
                    report.absorb(outcome);
                }
                Ok(Err(err)) => {
                    error!("{name}: {err}");
                    first_error.get_or_insert(err);
                }
                Err(_) => {
                    first_error.get_or_insert(PfaError::WorkerPanic(format!("dispatcher for {name} panicked")));
                }
            }
        }

        if self.options.restore_metadata {
            restore_directories(directories);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

/// Deepest first, so a read-only parent is applied after its children are done.
fn restore_directories(mut directories: Vec<(PathBuf, DirectorySection)>) {
    directories.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, section) in directories {
        if let Err(e) = fsx::restore(&path, &section) {
            warn!("cannot restore metadata of '{}': {e}", path.display());
        }
    }
}

/// Demultiplexes one stream to completion.
///
/// Truncation ends the stream early and turns every still-open file into a
/// `MissingFooter` issue; schema errors are returned after in-flight workers
/// have been shut down.
pub fn read_stream<R: Read>(stream: R, name: &str, options: &ReaderOptions) -> Result<StreamOutcome> {
    let (header, mut sections) = SectionReader::with_archive_header(stream)?;
    info!("{name}: reading stream created at {}", header.ctime);

    let mut outcome = StreamOutcome::new(name);
    let mut in_flight: HashMap<u64, InFlight> = HashMap::new();
    let result = dispatch(&mut sections, &mut in_flight, &mut outcome, options);

    let result = match result {
        Err(PfaError::Truncated(msg)) => {
            error!("{name}: truncated archive: {msg}");
            Ok(())
        }
        other => other,
    };

    outcome.leaked = in_flight.len();
    let mut leftovers: Vec<_> = in_flight.into_iter().collect();
    leftovers.sort_by_key(|(id, _)| *id);
    for (file_id, open) in leftovers {
        drop(open.bodies);
        let _ = open.worker.join();
        if result.is_ok() {
            outcome.report(file_id, &open.section.file.path, IssueKind::MissingFooter);
        }
    }
    result.map(|()| outcome)
}

fn dispatch<R: Read>(
    sections: &mut SectionReader<R>,
    in_flight: &mut HashMap<u64, InFlight>,
    outcome: &mut StreamOutcome,
    options: &ReaderOptions,
) -> Result<()> {
    while let Some(section) = sections.next_section()? {
        match section {
            Section::File(file) => open_file(file, in_flight, outcome, options)?,
            Section::FileBody { header, body } => match in_flight.get(&header.file_id) {
                Some(open) => {
                    if open.bodies.send(body).is_err() {
                        warn!("{}: worker for file id {} is gone", outcome.name, header.file_id);
                    }
                }
                None => outcome.report(header.file_id, "", IssueKind::OrphanFragment),
            },
            Section::FileFooter(footer) => match in_flight.remove(&footer.file_id) {
                Some(open) => close_file(open, footer.crc, outcome, options)?,
                None => outcome.report(footer.file_id, "", IssueKind::OrphanFooter),
            },
            Section::Directory(dir) => {
                outcome.directories += 1;
                debug!("{}: directory '{}'", outcome.name, dir.path);
                make_directory(dir, outcome, options);
            }
            Section::Softlink(link) => {
                outcome.softlinks += 1;
                debug!("{}: link '{}' -> '{}'", outcome.name, link.file.path, link.target);
                make_link(&link, outcome, options);
            }
        }
    }
    Ok(())
}

/// Destination for a stored path, or `None` when only verifying. Unsafe paths are
/// reported and verified without being written.
fn destination_for(stored: &str, file_id: u64, outcome: &mut StreamOutcome, options: &ReaderOptions) -> Option<PathBuf> {
    let root = options.destination.as_ref()?;
    match safe_relative(stored) {
        Some(rel) => Some(root.join(rel)),
        None => {
            outcome.report(file_id, stored, IssueKind::UnsafePath);
            None
        }
    }
}

fn open_file(
    section: FileSection,
    in_flight: &mut HashMap<u64, InFlight>,
    outcome: &mut StreamOutcome,
    options: &ReaderOptions,
) -> Result<()> {
    let file_id = section.file_id;
    if in_flight.contains_key(&file_id) {
        return Err(PfaError::DuplicateFileId(file_id));
    }
    let codec = Codec::from_tag(section.compression)?;
    let destination = destination_for(&section.file.path, file_id, outcome, options);
    debug!("{}: file '{}' id {file_id} ({codec})", outcome.name, section.file.path);

    let (bodies, queue) = bounded::<Vec<u8>>(1);
    let target = destination.clone();
    let worker = thread::Builder::new()
        .name(format!("pfa-file-{file_id}"))
        .spawn(move || file_worker(queue, codec, target))
        .map_err(|e| PfaError::Other(format!("could not spawn file worker: {e}")))?;
    in_flight.insert(file_id, InFlight { bodies, worker, section, destination });
    Ok(())
}

fn close_file(open: InFlight, expected: u64, outcome: &mut StreamOutcome, options: &ReaderOptions) -> Result<()> {
    let InFlight { bodies, worker, section, destination } = open;
    drop(bodies);
    let result = worker
        .join()
        .map_err(|_| PfaError::WorkerPanic(format!("worker for '{}' panicked", section.file.path)))?;

    let path = &section.file.path;
    if let Some(problem) = result.problem {
        outcome.report(section.file_id, path, problem);
        return Ok(());
    }
    if result.crc != expected {
        outcome.report(section.file_id, path, IssueKind::CrcMismatch { expected, actual: result.crc });
        return Ok(());
    }
    outcome.files += 1;
    outcome.bytes += result.bytes;

    if let (Some(target), true) = (destination, options.restore_metadata) {
        if let Err(e) = fsx::restore(&target, &section.file) {
            warn!("cannot restore metadata of '{}': {e}", target.display());
        }
    }
    Ok(())
}

fn file_worker(queue: Receiver<Vec<u8>>, codec: Codec, destination: Option<PathBuf>) -> FileResult {
    let mut crc = Crc64::new();
    let mut problem = None;
    let mut out = match destination.as_deref().map(create_output) {
        Some(Ok(file)) => Some(BufWriter::new(file)),
        Some(Err(e)) => {
            problem = Some(IssueKind::Write(e.to_string()));
            None
        }
        None => None,
    };

    for body in queue {
        if problem.is_some() {
            continue;
        }
        match codec.decompress_block(&body, 0) {
            Ok(raw) => {
                crc.update(&raw);
                if let Some(out) = out.as_mut() {
                    if let Err(e) = out.write_all(&raw) {
                        problem = Some(IssueKind::Write(e.to_string()));
                    }
                }
            }
            Err(e) => problem = Some(IssueKind::Decode(e.to_string())),
        }
    }
    if let Some(mut out) = out {
        if let Err(e) = out.flush() {
            problem.get_or_insert(IssueKind::Write(e.to_string()));
        }
    }
    FileResult { crc: crc.sum64(), bytes: crc.len(), problem }
}

fn create_output(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}

fn make_directory(dir: DirectorySection, outcome: &mut StreamOutcome, options: &ReaderOptions) {
    let Some(target) = destination_for(&dir.path, 0, outcome, options) else {
        return;
    };
    match fs::create_dir_all(&target) {
        Ok(()) => outcome.directories_to_restore.push((target, dir)),
        Err(e) => outcome.report(0, &dir.path, IssueKind::Write(e.to_string())),
    }
}

fn make_link(link: &SoftLinkSection, outcome: &mut StreamOutcome, options: &ReaderOptions) {
    let Some(target) = destination_for(&link.file.path, 0, outcome, options) else {
        return;
    };
    let created = match target.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
    .and_then(|()| fsx::symlink(&link.target, &target));
    if let Err(e) = created {
        outcome.report(0, &link.file.path, IssueKind::Write(e.to_string()));
    }
}

/// Resolves the streams of an archive: `input` itself, or `input.0`, `input.1`, …
/// in numeric order when a run wrote several.
pub fn input_paths(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    let pattern = format!("{}.*", glob::Pattern::escape(&input.to_string_lossy()));
    let entries = glob::glob(&pattern).map_err(|e| PfaError::Other(format!("bad input pattern: {e}")))?;

    let mut numbered: Vec<(usize, PathBuf)> = entries
        .flatten()
        .filter_map(|path| {
            let index = path.extension()?.to_str()?.parse::<usize>().ok()?;
            Some((index, path))
        })
        .collect();
    if numbered.is_empty() {
        return Err(PfaError::io(std::io::Error::from(std::io::ErrorKind::NotFound), input));
    }
    numbered.sort_by_key(|(index, _)| *index);
    Ok(numbered.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{body_prefix, footer_record, frame_structured, ArchiveHeader, SectionType};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn file_header(path: &str, id: u64, size: u64) -> Vec<u8> {
        let section = FileSection {
            file: DirectorySection { path: path.into(), mode: 0o644, ..Default::default() },
            size,
            file_id: id,
            compression: 0,
        };
        frame_structured(SectionType::File, &section.encode().unwrap()).unwrap()
    }

    fn body(id: u64, bytes: &[u8]) -> Vec<u8> {
        let mut out = body_prefix(id, bytes.len() as u64).to_vec();
        out.extend_from_slice(bytes);
        out
    }

    fn stream(records: &[Vec<u8>]) -> Vec<u8> {
        let mut out = ArchiveHeader::new(0).encode().to_vec();
        for r in records {
            out.extend_from_slice(r);
        }
        out
    }

    #[test]
    fn interleaved_fragments_are_demultiplexed() {
        let crc_a = Crc64::compute(b"aaaa1111");
        let crc_b = Crc64::compute(b"bbbb2222");
        let bytes = stream(&[
            file_header("a", 1, 8),
            file_header("b", 2, 8),
            body(2, b"bbbb"),
            body(1, b"aaaa"),
            body(1, b"1111"),
            body(2, b"2222"),
            footer_record(2, crc_b).to_vec(),
            footer_record(1, crc_a).to_vec(),
        ]);
        let outcome = read_stream(Cursor::new(bytes), "mem", &ReaderOptions::verify_only()).unwrap();
        assert_eq!(outcome.files, 2);
        assert_eq!(outcome.bytes, 16);
        assert!(outcome.issues.is_empty(), "{:?}", outcome.issues);
        assert_eq!(outcome.leaked, 0);
    }

    #[test]
    fn missing_footer_is_reported() {
        let bytes = stream(&[file_header("a", 1, 4), body(1, b"abcd")]);
        let outcome = read_stream(Cursor::new(bytes), "mem", &ReaderOptions::verify_only()).unwrap();
        assert_eq!(outcome.leaked, 1);
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].kind, IssueKind::MissingFooter);
        assert_eq!(outcome.issues[0].path, "a");
    }

    #[test]
    fn truncated_body_is_not_fatal() {
        let mut bytes = stream(&[file_header("a", 1, 4), body(1, b"abcd")]);
        bytes.truncate(bytes.len() - 2);
        let outcome = read_stream(Cursor::new(bytes), "mem", &ReaderOptions::verify_only()).unwrap();
        assert_eq!(outcome.issues[0].kind, IssueKind::MissingFooter);
    }

    #[test]
    fn orphans_are_reported_and_skipped() {
        let crc = Crc64::compute(b"ok");
        let bytes = stream(&[
            body(9, b"lost"),
            footer_record(8, 0).to_vec(),
            file_header("x", 1, 2),
            body(1, b"ok"),
            footer_record(1, crc).to_vec(),
        ]);
        let outcome = read_stream(Cursor::new(bytes), "mem", &ReaderOptions::verify_only()).unwrap();
        assert_eq!(outcome.files, 1);
        let kinds: Vec<_> = outcome.issues.iter().map(|i| i.kind.clone()).collect();
        assert_eq!(kinds, vec![IssueKind::OrphanFragment, IssueKind::OrphanFooter]);
    }

    #[test]
    fn duplicate_open_id_is_fatal() {
        let bytes = stream(&[file_header("a", 1, 0), file_header("b", 1, 0)]);
        let err = read_stream(Cursor::new(bytes), "mem", &ReaderOptions::verify_only()).unwrap_err();
        assert!(matches!(err, PfaError::DuplicateFileId(1)));
        assert!(err.is_fatal());
    }

    #[test]
    fn unknown_section_type_is_fatal() {
        let mut bytes = stream(&[]);
        bytes.extend_from_slice(&0x4650_3141u32.to_be_bytes());
        bytes.extend_from_slice(&77u16.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        let err = read_stream(Cursor::new(bytes), "mem", &ReaderOptions::verify_only()).unwrap_err();
        assert!(matches!(err, PfaError::UnknownSection(77)));
    }

    #[test]
    fn unsafe_paths_are_not_written() {
        let dest = tempdir().unwrap();
        let crc = Crc64::compute(b"evil");
        let bytes = stream(&[file_header("../escape", 1, 4), body(1, b"evil"), footer_record(1, crc).to_vec()]);
        let outcome = read_stream(Cursor::new(bytes), "mem", &ReaderOptions::extract_to(dest.path())).unwrap();
        assert_eq!(outcome.issues[0].kind, IssueKind::UnsafePath);
        assert!(!dest.path().parent().unwrap().join("escape").exists());
    }

    #[test]
    fn input_paths_sorts_numerically() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("out.pfa");
        for i in [10, 2, 0, 1] {
            fs::write(format!("{}.{i}", base.display()), b"").unwrap();
        }
        fs::write(format!("{}.log", base.display()), b"").unwrap();
        let found = input_paths(&base).unwrap();
        let suffixes: Vec<_> = found
            .iter()
            .map(|p| p.extension().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(suffixes, vec!["0", "1", "2", "10"]);

        fs::write(&base, b"").unwrap();
        assert_eq!(input_paths(&base).unwrap(), vec![base.clone()]);
        assert!(input_paths(&dir.path().join("none")).is_err());
    }
}
