//! # Container Format
//!
//! A `pfa` stream is a flat sequence of self-describing records:
//!
//! 1.  **Archive header** (once, at offset 0): `magic: u64 = "PFA1PFA1"`, `version: u16`,
//!     `ctime: u64` (unix seconds).
//! 2.  **Sections**, each introduced by an 8-byte section header
//!     `magic: u32 = "PFA1"`, `type: u16`, `header_size: u16`, followed by its payload:
//!     - `File` / `Directory` / `Softlink`: a structured payload of exactly `header_size` bytes.
//!     - `FileBody`: `file_id: u64`, `body_size: u64`, then `body_size` compressed bytes.
//!     - `FileFooter`: `file_id: u64`, `crc: u64`.
//!
//! All integers are big-endian. Strings are a `u16` byte length followed by UTF-8.
//! Body fragments of different files may interleave freely; the fragments of one
//! file are always in order and end with that file's footer.

use std::io::{self, Read};

use crate::error::{PfaError, Result};

/// Magic at the very start of every stream (`PFA1PFA1`).
pub const ARCHIVE_MAGIC: u64 = 0x5046_4131_5046_4131;
/// Magic at the start of every section header (`PFA1`).
pub const SECTION_MAGIC: u32 = 0x4650_3141;
pub const FORMAT_VERSION: u16 = 1;

pub const ARCHIVE_HEADER_SIZE: usize = 18;
pub const SECTION_HEADER_SIZE: usize = 8;
/// Fixed payload size of both `FileBody` and `FileFooter` sections.
pub const FIXED_PAYLOAD_SIZE: usize = 16;

/// Type tag carried by every section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SectionType {
    File = 0,
    Directory = 1,
    Softlink = 2,
    FileBody = 3,
    FileFooter = 4,
}

impl SectionType {
    pub fn name(self) -> &'static str {
        match self {
            SectionType::File => "file",
            SectionType::Directory => "directory",
            SectionType::Softlink => "softlink",
            SectionType::FileBody => "file body",
            SectionType::FileFooter => "file footer",
        }
    }
}

impl TryFrom<u16> for SectionType {
    type Error = PfaError;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            0 => SectionType::File,
            1 => SectionType::Directory,
            2 => SectionType::Softlink,
            3 => SectionType::FileBody,
            4 => SectionType::FileFooter,
            other => return Err(PfaError::UnknownSection(other)),
        })
    }
}

/// Identifies a stream; written once before the first section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub magic: u64,
    pub version: u16,
    pub ctime: u64,
}

impl ArchiveHeader {
    pub fn new(ctime: u64) -> Self {
        Self { magic: ARCHIVE_MAGIC, version: FORMAT_VERSION, ctime }
    }

    pub fn encode(&self) -> [u8; ARCHIVE_HEADER_SIZE] {
        let mut out = [0u8; ARCHIVE_HEADER_SIZE];
        out[..8].copy_from_slice(&self.magic.to_be_bytes());
        out[8..10].copy_from_slice(&self.version.to_be_bytes());
        out[10..].copy_from_slice(&self.ctime.to_be_bytes());
        out
    }

    /// Reads and validates the header. A wrong magic or a newer version is fatal.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; ARCHIVE_HEADER_SIZE];
        if !read_full(reader, &mut buf)? {
            return Err(PfaError::Truncated("stream is empty, no archive header".into()));
        }
        let header = Self {
            magic: be_u64(&buf[..8]),
            version: u16::from_be_bytes([buf[8], buf[9]]),
            ctime: be_u64(&buf[10..]),
        };
        if header.magic != ARCHIVE_MAGIC {
            return Err(PfaError::BadMagic { found: header.magic });
        }
        if header.version == 0 || header.version > FORMAT_VERSION {
            return Err(PfaError::UnsupportedVersion(header.version));
        }
        Ok(header)
    }
}

/// Precedes every record in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub magic: u32,
    /// Raw type tag; kept raw so an unknown tag can be reported verbatim.
    pub section_type: u16,
    pub header_size: u16,
}

impl SectionHeader {
    pub fn new(kind: SectionType, header_size: u16) -> Self {
        Self { magic: SECTION_MAGIC, section_type: kind as u16, header_size }
    }

    pub fn kind(&self) -> Result<SectionType> {
        SectionType::try_from(self.section_type)
    }

    pub fn encode(&self) -> [u8; SECTION_HEADER_SIZE] {
        let mut out = [0u8; SECTION_HEADER_SIZE];
        out[..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.section_type.to_be_bytes());
        out[6..].copy_from_slice(&self.header_size.to_be_bytes());
        out
    }

    /// Returns `Ok(None)` on a clean end of stream (no bytes left at a section boundary).
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Self>> {
        let mut buf = [0u8; SECTION_HEADER_SIZE];
        if !read_full(reader, &mut buf)? {
            return Ok(None);
        }
        let header = Self {
            magic: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            section_type: u16::from_be_bytes([buf[4], buf[5]]),
            header_size: u16::from_be_bytes([buf[6], buf[7]]),
        };
        if header.magic != SECTION_MAGIC {
            return Err(PfaError::BadMagic { found: header.magic as u64 });
        }
        Ok(Some(header))
    }
}

/// A directory entry, or the metadata half of a file / softlink entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySection {
    /// Path in UTF-8, already joined from parent and name.
    pub path: String,
    pub uid: u32,
    pub gid: u32,
    pub owner: String,
    pub group: String,
    pub mtime: u64,
    pub ctime: u64,
    pub atime: u64,
    pub mode: u64,
}

impl DirectorySection {
    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        put_str(out, &self.path)?;
        out.extend_from_slice(&self.uid.to_be_bytes());
        out.extend_from_slice(&self.gid.to_be_bytes());
        put_str(out, &self.owner)?;
        put_str(out, &self.group)?;
        out.extend_from_slice(&self.mtime.to_be_bytes());
        out.extend_from_slice(&self.ctime.to_be_bytes());
        out.extend_from_slice(&self.atime.to_be_bytes());
        out.extend_from_slice(&self.mode.to_be_bytes());
        Ok(())
    }

    fn decode_from(cur: &mut Payload<'_>) -> Option<Self> {
        Some(Self {
            path: cur.string()?,
            uid: cur.u32()?,
            gid: cur.u32()?,
            owner: cur.string()?,
            group: cur.string()?,
            mtime: cur.u64()?,
            ctime: cur.u64()?,
            atime: cur.u64()?,
            mode: cur.u64()?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64 + self.path.len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        decode_exact(payload, SectionType::Directory, Self::decode_from)
    }
}

/// Header of one archived regular file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSection {
    pub file: DirectorySection,
    pub size: u64,
    /// Unique within the owning stream, assigned from 1 upwards at write time.
    pub file_id: u64,
    pub compression: u16,
}

impl FileSection {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(96 + self.file.path.len());
        self.file.encode_into(&mut out)?;
        out.extend_from_slice(&self.size.to_be_bytes());
        out.extend_from_slice(&self.file_id.to_be_bytes());
        out.extend_from_slice(&self.compression.to_be_bytes());
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        decode_exact(payload, SectionType::File, |cur| {
            Some(Self {
                file: DirectorySection::decode_from(cur)?,
                size: cur.u64()?,
                file_id: cur.u64()?,
                compression: cur.u16()?,
            })
        })
    }
}

/// Header of one compressed chunk of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilebodySection {
    pub file_id: u64,
    pub body_size: u64,
}

impl FilebodySection {
    pub fn encode(&self) -> [u8; FIXED_PAYLOAD_SIZE] {
        encode_pair(self.file_id, self.body_size)
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let (file_id, body_size) = read_pair(reader, SectionType::FileBody)?;
        Ok(Self { file_id, body_size })
    }
}

/// Terminates the section run of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFooter {
    pub file_id: u64,
    /// CRC-64/ISO over the uncompressed bytes.
    pub crc: u64,
}

impl FileFooter {
    pub fn encode(&self) -> [u8; FIXED_PAYLOAD_SIZE] {
        encode_pair(self.file_id, self.crc)
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let (file_id, crc) = read_pair(reader, SectionType::FileFooter)?;
        Ok(Self { file_id, crc })
    }
}

/// A symbolic link and its target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftLinkSection {
    pub file: DirectorySection,
    pub target: String,
}

impl SoftLinkSection {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64 + self.file.path.len() + self.target.len());
        self.file.encode_into(&mut out)?;
        put_str(&mut out, &self.target)?;
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        decode_exact(payload, SectionType::Softlink, |cur| {
            Some(Self { file: DirectorySection::decode_from(cur)?, target: cur.string()? })
        })
    }
}

/// Frames a structured payload (File / Directory / Softlink) with its section header.
pub fn frame_structured(kind: SectionType, payload: &[u8]) -> Result<Vec<u8>> {
    let size = u16::try_from(payload.len()).map_err(|_| {
        PfaError::Other(format!("{} header of {} bytes exceeds the 64 KiB limit", kind.name(), payload.len()))
    })?;
    let mut out = Vec::with_capacity(SECTION_HEADER_SIZE + payload.len());
    out.extend_from_slice(&SectionHeader::new(kind, size).encode());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Section header plus body header for one fragment; the compressed bytes follow.
pub fn body_prefix(file_id: u64, body_size: u64) -> [u8; SECTION_HEADER_SIZE + FIXED_PAYLOAD_SIZE] {
    let mut out = [0u8; SECTION_HEADER_SIZE + FIXED_PAYLOAD_SIZE];
    out[..SECTION_HEADER_SIZE].copy_from_slice(&SectionHeader::new(SectionType::FileBody, 0).encode());
    out[SECTION_HEADER_SIZE..].copy_from_slice(&FilebodySection { file_id, body_size }.encode());
    out
}

pub fn footer_record(file_id: u64, crc: u64) -> [u8; SECTION_HEADER_SIZE + FIXED_PAYLOAD_SIZE] {
    let mut out = [0u8; SECTION_HEADER_SIZE + FIXED_PAYLOAD_SIZE];
    out[..SECTION_HEADER_SIZE].copy_from_slice(&SectionHeader::new(SectionType::FileFooter, 0).encode());
    out[SECTION_HEADER_SIZE..].copy_from_slice(&FileFooter { file_id, crc }.encode());
    out
}

/// One decoded record as seen by a sequential consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    File(FileSection),
    Directory(DirectorySection),
    Softlink(SoftLinkSection),
    /// `body` is empty when the reader was asked to skip bodies.
    FileBody { header: FilebodySection, body: Vec<u8> },
    FileFooter(FileFooter),
}

/// Pulls sections off a stream one at a time.
///
/// The caller is expected to have consumed the archive header already (see
/// [`SectionReader::with_archive_header`]).
pub struct SectionReader<R> {
    inner: R,
    skip_bodies: bool,
}

impl<R: Read> SectionReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, skip_bodies: false }
    }

    /// Validates the archive header first, then returns the section reader.
    pub fn with_archive_header(mut inner: R) -> Result<(ArchiveHeader, Self)> {
        let header = ArchiveHeader::read_from(&mut inner)?;
        Ok((header, Self::new(inner)))
    }

    /// Body bytes are read past and dropped instead of being returned.
    pub fn skip_bodies(mut self, skip: bool) -> Self {
        self.skip_bodies = skip;
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Returns `Ok(None)` at a clean end of stream.
    pub fn next_section(&mut self) -> Result<Option<Section>> {
        let Some(header) = SectionHeader::read_from(&mut self.inner)? else {
            return Ok(None);
        };
        let section = match header.kind()? {
            SectionType::File => Section::File(FileSection::decode(&self.read_payload(&header)?)?),
            SectionType::Directory => {
                Section::Directory(DirectorySection::decode(&self.read_payload(&header)?)?)
            }
            SectionType::Softlink => {
                Section::Softlink(SoftLinkSection::decode(&self.read_payload(&header)?)?)
            }
            SectionType::FileBody => {
                let body_header = FilebodySection::read_from(&mut self.inner)?;
                let body = if self.skip_bodies {
                    let skipped = io::copy(&mut (&mut self.inner).take(body_header.body_size), &mut io::sink())?;
                    if skipped != body_header.body_size {
                        return Err(PfaError::Truncated(format!(
                            "body of file id {} ends after {skipped} of {} bytes",
                            body_header.file_id, body_header.body_size
                        )));
                    }
                    Vec::new()
                } else {
                    read_body(&mut self.inner, &body_header)?
                };
                Section::FileBody { header: body_header, body }
            }
            SectionType::FileFooter => Section::FileFooter(FileFooter::read_from(&mut self.inner)?),
        };
        Ok(Some(section))
    }

    fn read_payload(&mut self, header: &SectionHeader) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; header.header_size as usize];
        if !read_full(&mut self.inner, &mut payload)? && !payload.is_empty() {
            return Err(PfaError::Truncated("stream ends inside a section header payload".into()));
        }
        Ok(payload)
    }
}

/// Reads exactly `body_size` bytes of a fragment.
pub fn read_body<R: Read + ?Sized>(reader: &mut R, header: &FilebodySection) -> Result<Vec<u8>> {
    let len = usize::try_from(header.body_size)
        .map_err(|_| PfaError::Other(format!("body of {} bytes does not fit in memory", header.body_size)))?;
    let mut body = Vec::new();
    reader.take(header.body_size).read_to_end(&mut body)?;
    if body.len() != len {
        return Err(PfaError::Truncated(format!(
            "body of file id {} ends after {} of {} bytes",
            header.file_id,
            body.len(),
            len
        )));
    }
    Ok(body)
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Fills `buf` completely. `Ok(false)` means the stream was already at EOF;
/// EOF after a partial read is a truncation error.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if filled == 0 && !buf.is_empty() {
        return Ok(false);
    }
    if filled < buf.len() {
        return Err(PfaError::Truncated(format!("record ends after {filled} of {} bytes", buf.len())));
    }
    Ok(true)
}

fn read_pair<R: Read + ?Sized>(reader: &mut R, kind: SectionType) -> Result<(u64, u64)> {
    let mut buf = [0u8; FIXED_PAYLOAD_SIZE];
    if !read_full(reader, &mut buf)? {
        return Err(PfaError::Truncated(format!("stream ends before {} payload", kind.name())));
    }
    Ok((be_u64(&buf[..8]), be_u64(&buf[8..])))
}

fn encode_pair(a: u64, b: u64) -> [u8; FIXED_PAYLOAD_SIZE] {
    let mut out = [0u8; FIXED_PAYLOAD_SIZE];
    out[..8].copy_from_slice(&a.to_be_bytes());
    out[8..].copy_from_slice(&b.to_be_bytes());
    out
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(arr)
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| PfaError::Other(format!("string of {} bytes too long for a section header", s.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Runs `parse` over the whole payload; running short or leaving bytes behind
/// both mean the payload does not match its declared size.
fn decode_exact<T>(
    payload: &[u8],
    kind: SectionType,
    parse: impl FnOnce(&mut Payload<'_>) -> Option<T>,
) -> Result<T> {
    let mut cur = Payload { data: payload, pos: 0 };
    let parsed = parse(&mut cur);
    match parsed {
        Some(value) if cur.pos == payload.len() => Ok(value),
        _ => Err(PfaError::MalformedSection { kind: kind.name(), declared: payload.len(), consumed: cur.pos }),
    }
}

struct Payload<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(be_u64)
    }

    fn string(&mut self) -> Option<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_dir() -> DirectorySection {
        DirectorySection {
            path: "data/sub".into(),
            uid: 1000,
            gid: 100,
            owner: "alice".into(),
            group: "users".into(),
            mtime: 1_700_000_000,
            ctime: 1_700_000_001,
            atime: 1_700_000_002,
            mode: 0o755,
        }
    }

    #[test]
    fn section_header_layout_is_big_endian() {
        let bytes = SectionHeader::new(SectionType::Directory, 0x0102).encode();
        assert_eq!(bytes, [0x46, 0x50, 0x31, 0x41, 0x00, 0x01, 0x01, 0x02]);
    }

    #[test]
    fn archive_header_rejects_foreign_magic() {
        let mut bytes = ArchiveHeader::new(5).encode();
        bytes[0] = b'X';
        let err = ArchiveHeader::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, PfaError::BadMagic { .. }));
    }

    #[test]
    fn archive_header_rejects_newer_version() {
        let mut header = ArchiveHeader::new(5);
        header.version = FORMAT_VERSION + 1;
        let err = ArchiveHeader::read_from(&mut Cursor::new(header.encode())).unwrap_err();
        assert!(matches!(err, PfaError::UnsupportedVersion(_)));
    }

    #[test]
    fn file_section_payload_roundtrips() {
        let section = FileSection { file: sample_dir(), size: 42, file_id: 7, compression: 1 };
        let payload = section.encode().unwrap();
        assert_eq!(FileSection::decode(&payload).unwrap(), section);
    }

    #[test]
    fn payload_size_mismatch_is_malformed() {
        let mut payload = sample_dir().encode().unwrap();
        payload.push(0);
        assert!(matches!(
            DirectorySection::decode(&payload),
            Err(PfaError::MalformedSection { kind: "directory", .. })
        ));
        payload.truncate(payload.len() - 5);
        assert!(matches!(DirectorySection::decode(&payload), Err(PfaError::MalformedSection { .. })));
    }

    #[test]
    fn section_reader_walks_mixed_records() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&ArchiveHeader::new(1).encode());
        stream.extend(frame_structured(SectionType::Directory, &sample_dir().encode().unwrap()).unwrap());
        let link = SoftLinkSection { file: sample_dir(), target: "../elsewhere".into() };
        stream.extend(frame_structured(SectionType::Softlink, &link.encode().unwrap()).unwrap());
        stream.extend_from_slice(&body_prefix(1, 3));
        stream.extend_from_slice(b"abc");
        stream.extend_from_slice(&footer_record(1, 99));

        let (header, mut reader) = SectionReader::with_archive_header(Cursor::new(stream)).unwrap();
        assert_eq!(header.version, FORMAT_VERSION);
        assert!(matches!(reader.next_section().unwrap(), Some(Section::Directory(_))));
        assert_eq!(reader.next_section().unwrap(), Some(Section::Softlink(link)));
        match reader.next_section().unwrap() {
            Some(Section::FileBody { header, body }) => {
                assert_eq!(header.file_id, 1);
                assert_eq!(body, b"abc");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reader.next_section().unwrap(), Some(Section::FileFooter(FileFooter { file_id: 1, crc: 99 })));
        assert_eq!(reader.next_section().unwrap(), None);
    }

    #[test]
    fn unknown_section_type_is_reported() {
        let mut stream = SectionHeader { magic: SECTION_MAGIC, section_type: 9, header_size: 0 }.encode().to_vec();
        stream.extend_from_slice(&[0u8; 4]);
        let mut reader = SectionReader::new(Cursor::new(stream));
        assert!(matches!(reader.next_section(), Err(PfaError::UnknownSection(9))));
    }

    #[test]
    fn partial_section_header_is_truncation() {
        let mut reader = SectionReader::new(Cursor::new(vec![0x46, 0x50, 0x31]));
        assert!(matches!(reader.next_section(), Err(PfaError::Truncated(_))));
    }

    #[test]
    fn short_body_is_truncation() {
        let mut stream = body_prefix(4, 10).to_vec();
        stream.extend_from_slice(b"short");
        let mut reader = SectionReader::new(Cursor::new(stream.clone()));
        assert!(matches!(reader.next_section(), Err(PfaError::Truncated(_))));
        let mut skipping = SectionReader::new(Cursor::new(stream)).skip_bodies(true);
        assert!(matches!(skipping.next_section(), Err(PfaError::Truncated(_))));
    }
}
