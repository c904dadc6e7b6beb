// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Binary codec for stream files: a fixed header followed by length-prefixed
//! notification records.
//!
//! Integer fields are little-endian on disk. The high byte of the version
//! word doubles as a byte-order marker: a file produced by a foreign-order
//! host reads back as a different byte sequence and is rejected as
//! not-a-stream rather than byte-swapped.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::{Result, StreamError};

pub const MAGIC: &[u8; 8] = b"NCSTREAM";
pub const VERSION: u16 = 0xFF01;

/// Bytes of the `record_len` + `event_time` prefix in front of every record.
pub const RECORD_PREFIX_BYTES: u64 = 4 + 8;

/// Decoded stream-file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub name: String,
    pub description: String,
    pub replay: bool,
    pub created: u64,
}

/// A stream file opened read+write with its header decoded and the cursor
/// left at the start of the data region.
#[derive(Debug)]
pub struct OpenedStream {
    pub file: File,
    pub header: StreamHeader,
    pub data_offset: u64,
}

/// Truncates `file` and writes a fresh header, returning the byte offset at
/// which the data region starts.
pub fn write_header(file: &mut File, header: &StreamHeader) -> io::Result<u64> {
    let name = header.name.as_bytes();
    let desc = header.description.as_bytes();

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(MAGIC)?;
    file.write_all(&VERSION.to_le_bytes())?;
    file.write_all(&(name.len() as u16 + 1).to_le_bytes())?;
    file.write_all(name)?;
    file.write_all(&[0])?;
    // An empty description is still encoded, as a single NUL.
    file.write_all(&(desc.len() as u16 + 1).to_le_bytes())?;
    file.write_all(desc)?;
    file.write_all(&[0])?;
    file.write_all(&[header.replay as u8])?;
    file.write_all(&header.created.to_le_bytes())?;
    file.stream_position()
}

/// Opens `path` read+write and decodes its header.
///
/// Returns `Ok(None)` when the file is not a stream file: wrong magic, or a
/// version word written by a host of foreign byte order. Damage after a valid
/// magic is a real error.
pub fn read_header(path: &Path) -> Result<Option<OpenedStream>> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;

    let mut magic = [0u8; 8];
    if !read_exact_or_eof(&mut file, &mut magic)? || &magic != MAGIC {
        return Ok(None);
    }
    let mut version = [0u8; 2];
    if !read_exact_or_eof(&mut file, &mut version)? || u16::from_le_bytes(version) != VERSION {
        return Ok(None);
    }

    let name = read_lenprefixed_string(&mut file)?;
    if name.is_empty() {
        return Err(StreamError::Parse("empty stream name in header".into()));
    }
    let description = read_lenprefixed_string(&mut file)?;

    let mut replay = [0u8; 1];
    file.read_exact(&mut replay)?;
    let replay = match replay[0] {
        0 => false,
        1 => true,
        other => {
            return Err(StreamError::Parse(format!(
                "invalid replay flag {other} in header"
            )))
        }
    };

    let mut created = [0u8; 8];
    file.read_exact(&mut created)?;
    let created = u64::from_le_bytes(created);

    let data_offset = file.stream_position()?;
    Ok(Some(OpenedStream {
        file,
        header: StreamHeader {
            name,
            description,
            replay,
            created,
        },
        data_offset,
    }))
}

/// Record prefix: length of the XML payload (including its trailing NUL) and
/// the event time in epoch seconds.
#[derive(Debug, Clone, Copy)]
pub struct RecordMeta {
    pub len: u32,
    pub event_time: u64,
}

impl RecordMeta {
    /// Offset of the record following the one this prefix belongs to.
    pub fn next_offset(&self, offset: u64) -> u64 {
        offset + RECORD_PREFIX_BYTES + self.len as u64
    }
}

/// Reads the record prefix at `offset`, or `None` at end of log.
///
/// Callers hold the file lock, so a record is either fully present or not
/// yet there; a torn prefix only occurs after a writer crash and is treated
/// as end of log.
pub fn peek_record(file: &File, offset: u64) -> Result<Option<RecordMeta>> {
    let mut buf = [0u8; RECORD_PREFIX_BYTES as usize];
    match read_exact_at_retry(file, &mut buf, offset) {
        Ok(()) => {}
        Err(StreamError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(None)
        }
        Err(err) => return Err(err),
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let mut time = [0u8; 8];
    time.copy_from_slice(&buf[4..12]);
    Ok(Some(RecordMeta {
        len,
        event_time: u64::from_le_bytes(time),
    }))
}

/// Reads the XML payload of the record whose prefix sits at `offset`,
/// stripping the trailing NUL.
pub fn read_record_xml(file: &File, offset: u64, meta: RecordMeta) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; meta.len as usize];
    read_exact_at_retry(file, &mut buf, offset + RECORD_PREFIX_BYTES)?;
    if buf.last() == Some(&0) {
        buf.pop();
    }
    Ok(buf)
}

/// Appends one record at the end of the log. On a failed or partial write the
/// file is truncated back to its previous length so a torn record is never
/// left behind.
pub fn append_record(file: &File, event_time: u64, xml: &[u8]) -> Result<()> {
    let mut f = file;
    let start = f.seek(SeekFrom::End(0))?;

    let write = (|| -> io::Result<()> {
        f.write_all(&(xml.len() as u32 + 1).to_le_bytes())?;
        f.write_all(&event_time.to_le_bytes())?;
        f.write_all(xml)?;
        f.write_all(&[0])?;
        Ok(())
    })();

    if let Err(err) = write {
        let _ = file.set_len(start);
        return Err(err.into());
    }
    Ok(())
}

fn read_lenprefixed_string(file: &mut File) -> Result<String> {
    let mut len = [0u8; 2];
    file.read_exact(&mut len)?;
    let len = u16::from_le_bytes(len) as usize;
    if len == 0 {
        return Err(StreamError::Parse("zero-length string in header".into()));
    }
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    if buf.pop() != Some(0) {
        return Err(StreamError::Parse("header string is not NUL-terminated".into()));
    }
    String::from_utf8(buf).map_err(|_| StreamError::Parse("header string is not UTF-8".into()))
}

/// `read_exact` that reports a clean `false` when the file ends before the
/// first byte of `buf`.
fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> io::Result<bool> {
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}

fn read_exact_at_retry(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    loop {
        match file.read_exact_at(buf, offset).map_err(StreamError::from) {
            Ok(()) => return Ok(()),
            Err(StreamError::IoTransient(_)) => continue,
            Err(err) => return Err(err),
        }
    }
}
