// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

/// Failures of the stream engine proper.
///
/// `NotAStream` is benign during directory scans and is normally absorbed by
/// the scanner. `IoTransient` is the EINTR/EAGAIN class: the operation is
/// safe to retry, and the record read/write paths do. Everything else is
/// either swallowed-and-logged on the publish path or terminal for the
/// operation that observed it.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("not a stream file")]
    NotAStream,
    #[error("transient i/o: {0}")]
    IoTransient(#[source] io::Error),
    #[error("i/o: {0}")]
    Io(#[source] io::Error),
    #[error("file lock: {0}")]
    Lock(#[source] io::Error),
    #[error("mapping rule table: {0}")]
    Map(#[source] io::Error),
    #[error("notification bus is closed")]
    BusClosed,
    #[error("malformed payload: {0}")]
    Parse(String),
    #[error("rule table of stream {0} is full")]
    RuleCapacity(String),
    #[error("stream {0} already exists")]
    DuplicateStream(String),
    #[error("stream {0} does not exist")]
    UnknownStream(String),
    #[error("stream registry is closed")]
    Gone,
}

/// Classifies by errno class, so retry loops can match on `IoTransient`.
impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> StreamError {
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
                StreamError::IoTransient(err)
            }
            _ => StreamError::Io(err),
        }
    }
}

impl From<quick_xml::Error> for StreamError {
    fn from(err: quick_xml::Error) -> Self {
        StreamError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
