//! Sequential inventory of archive streams.
//!
//! Walks the section stream without routing or decoding bodies; file and directory
//! headers become [`ListEntry`] rows. No checksums are verified here.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::error::{PfaError, Result};
use crate::format::{Section, SectionReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Softlink,
}

/// One row of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub kind: EntryKind,
    pub path: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<u64>,
    pub mode: u64,
    pub mtime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ListEntry {
    /// Directories print as ten spaces and the path, files as a right-aligned size and the path.
    pub fn display_line(&self) -> String {
        match self.kind {
            EntryKind::Directory => format!("{:10}{}", "", self.path),
            EntryKind::File => format!("{:9} {}", self.size, self.path),
            EntryKind::Softlink => {
                format!("{:10}{} -> {}", "", self.path, self.target.as_deref().unwrap_or_default())
            }
        }
    }
}

/// Lists one stream in wire order.
pub fn list<R: Read>(stream: R) -> Result<Vec<ListEntry>> {
    let (_, sections) = SectionReader::with_archive_header(stream)?;
    let mut sections = sections.skip_bodies(true);
    let mut entries = Vec::new();
    while let Some(section) = sections.next_section()? {
        match section {
            Section::Directory(dir) => entries.push(ListEntry {
                kind: EntryKind::Directory,
                path: dir.path,
                size: 0,
                file_id: None,
                mode: dir.mode,
                mtime: dir.mtime,
                target: None,
            }),
            Section::File(file) => entries.push(ListEntry {
                kind: EntryKind::File,
                path: file.file.path,
                size: file.size,
                file_id: Some(file.file_id),
                mode: file.file.mode,
                mtime: file.file.mtime,
                target: None,
            }),
            Section::Softlink(link) => entries.push(ListEntry {
                kind: EntryKind::Softlink,
                path: link.file.path,
                size: 0,
                file_id: None,
                mode: link.file.mode,
                mtime: link.file.mtime,
                target: Some(link.target),
            }),
            Section::FileBody { .. } | Section::FileFooter(_) => {}
        }
    }
    debug!("listed {} entries", entries.len());
    Ok(entries)
}

/// Lists several stream files in parallel; rows come back in stream order.
pub fn list_streams(paths: &[PathBuf]) -> Result<Vec<ListEntry>> {
    let per_stream: Vec<Vec<ListEntry>> = paths
        .par_iter()
        .map(|path| {
            let file = File::open(path).map_err(|e| PfaError::io(e, path))?;
            list(BufReader::new(file))
        })
        .collect::<Result<_>>()?;
    Ok(per_stream.into_iter().flatten().collect())
}
