use pfa::archive::ArchiveWriter;
use pfa::common::DirEntry;
use pfa::compress::Codec;
use pfa::config::{ArchiveConfig, ReaderOptions};
use pfa::error::IssueKind;
use pfa::extract::{read_stream, ArchiveReader};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use tempfile::tempdir;

// ---------- helpers ----------
fn archive_of(dir: &Path, files: &[(&str, &[u8])]) -> Vec<u8> {
    let config = ArchiveConfig::default().with_workers(4).with_chunk_size(32).with_codec(Codec::None);
    let writer = ArchiveWriter::new(Vec::new(), &config).unwrap();
    for (name, content) in files {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        writer.append_file(DirEntry::from_path(&path).unwrap()).unwrap();
    }
    writer.finish().unwrap().0
}

fn find(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).position(|w| w == needle).unwrap()
}

#[test]
fn flipped_body_byte_is_a_crc_mismatch() {
    let dir = tempdir().unwrap();
    let mut bytes = archive_of(
        dir.path(),
        &[("victim", b"0123456789abcdefVICTIM-PAYLOAD"), ("bystander", b"perfectly fine content")],
    );
    let at = find(&bytes, b"VICTIM");
    bytes[at] ^= 0x20;

    let outcome = read_stream(Cursor::new(bytes), "flipped", &ReaderOptions::verify_only()).unwrap();
    assert_eq!(outcome.issues.len(), 1, "{:?}", outcome.issues);
    let issue = &outcome.issues[0];
    assert!(issue.path.ends_with("/victim"));
    assert!(matches!(issue.kind, IssueKind::CrcMismatch { .. }));
    // the next record was still found, so the stream stayed in sync
    assert_eq!(outcome.files, 1);
    assert_eq!(outcome.leaked, 0);
}

#[test]
fn truncated_stream_reports_missing_footer() {
    let dir = tempdir().unwrap();
    let big = vec![b'z'; 200];
    let bytes = archive_of(dir.path(), &[("big", &big)]);
    // drop the footer and half of the last fragment
    let cut = bytes.len() - 24 - 4;
    let outcome = read_stream(Cursor::new(bytes[..cut].to_vec()), "cut", &ReaderOptions::verify_only()).unwrap();
    assert_eq!(outcome.files, 0);
    assert_eq!(outcome.issues.len(), 1);
    assert_eq!(outcome.issues[0].kind, IssueKind::MissingFooter);
}

#[test]
fn corrupt_stream_does_not_stop_other_streams() {
    let dir = tempdir().unwrap();
    let good = archive_of(dir.path(), &[("g1", b"good one"), ("g2", b"good two")]);
    let mut bad = archive_of(dir.path(), &[("b1", b"BAD-ONE-CONTENT")]);
    let at = find(&bad, b"BAD");
    bad[at] = b'M';

    let mut reader = ArchiveReader::new(ReaderOptions::verify_only());
    reader.add_file(Cursor::new(good), "good").unwrap();
    reader.add_file(Cursor::new(bad), "bad").unwrap();
    let report = reader.finish().unwrap();
    assert_eq!(report.streams, 2);
    assert_eq!(report.files, 2);
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].stream, "bad");
    assert!(!report.is_clean());
}

#[test]
fn foreign_input_is_fatal() {
    let mut reader = ArchiveReader::new(ReaderOptions::verify_only());
    reader.add_file(Cursor::new(b"PK\x03\x04 not ours at all".to_vec()), "zip").unwrap();
    let err = reader.finish().unwrap_err();
    assert!(err.is_fatal(), "{err}");
}
