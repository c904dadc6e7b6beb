// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide table of open streams.
//!
//! Streams live in an arena of slots; handles are `StreamId`s carrying the
//! slot index plus a generation counter, so a handle held across a registry
//! teardown resolves to `Gone` instead of a recycled stream. The registry
//! mutex serializes structural changes and rule-table appends; inner
//! operations receive the locked state directly and never re-lock.

use std::fs::{self, File, OpenOptions, Permissions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use netconf_common::MutexExt;
use tracing::{debug, info, warn};

use crate::codec::{self, StreamHeader};
use crate::error::{Result, StreamError};
use crate::rules::RuleTable;
use crate::xml;

/// The stream every deployment has; created on first init.
pub const BASE_STREAM: &str = "NETCONF";

/// RFC 6470 base event names pre-allowed on the base stream.
pub const BASE_EVENTS: [&str; 5] = [
    "netconf-config-change",
    "netconf-capability-change",
    "netconf-session-start",
    "netconf-session-end",
    "netconf-confirmed-commit",
];

const FILE_MODE: u32 = 0o777;

/// Stable handle to a registered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamId {
    index: usize,
    generation: u64,
}

/// Public snapshot of one stream's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub description: String,
    pub replay: bool,
    pub created: u64,
}

pub(crate) struct StreamEntry {
    pub generation: u64,
    pub name: String,
    pub description: String,
    pub replay: bool,
    pub created: u64,
    pub file: File,
    pub data_offset: u64,
    pub rules: RuleTable,
}

pub(crate) struct RegistryInner {
    dir: PathBuf,
    slots: Vec<Option<StreamEntry>>,
    next_generation: u64,
    status: String,
}

/// The registry proper; `None` inside the mutex once closed.
pub(crate) struct Registry {
    inner: Mutex<Option<RegistryInner>>,
}

impl Registry {
    /// Scans `dir`, registers every stream file found there, and creates the
    /// base `NETCONF` stream when absent.
    pub fn init(dir: PathBuf) -> Result<Registry> {
        let mut inner = RegistryInner {
            dir,
            slots: Vec::new(),
            next_generation: 1,
            status: String::new(),
        };
        inner.scan()?;
        if inner.find(BASE_STREAM).is_none() {
            let id = inner.create(BASE_STREAM, "default NETCONF event stream", true)?;
            for event in BASE_EVENTS {
                inner.allow(id, event)?;
            }
        }
        inner.rebuild_status();
        info!(
            streams = inner.slots.iter().flatten().count(),
            dir = %inner.dir.display(),
            "notification stream registry initialized"
        );
        Ok(Registry {
            inner: Mutex::new(Some(inner)),
        })
    }

    /// Runs `f` on the locked registry state; `Gone` once closed.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut RegistryInner) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.lock_or_panic();
        match guard.as_mut() {
            Some(inner) => f(inner),
            None => Err(StreamError::Gone),
        }
    }

    /// Resolves `id` and runs `f` on its entry while the registry lock is
    /// held. `Gone` when the registry closed or the generation is stale.
    pub fn with_stream<R>(&self, id: StreamId, f: impl FnOnce(&StreamEntry) -> Result<R>) -> Result<R> {
        self.with_inner(|inner| match inner.entry(id) {
            Some(entry) => f(entry),
            None => Err(StreamError::Gone),
        })
    }

    /// Drops every stream (closing files and unmapping rule tables); any
    /// outstanding `StreamId` resolves to `Gone` afterwards.
    pub fn close(&self) {
        let mut guard = self.inner.lock_or_panic();
        if guard.take().is_some() {
            debug!("notification stream registry closed");
        }
    }
}

impl RegistryInner {
    /// Lookup by name, falling back to probing `<name>.events` on disk so a
    /// stream created by another process since init is discovered lazily.
    pub fn get_or_probe(&mut self, name: &str) -> Result<StreamId> {
        if let Some(id) = self.find(name) {
            return Ok(id);
        }
        let path = self.dir.join(format!("{name}.events"));
        match codec::read_header(&path) {
            Ok(Some(opened)) if opened.header.name == name => self.insert(opened),
            Ok(_) => Err(StreamError::UnknownStream(name.to_string())),
            Err(StreamError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StreamError::UnknownStream(name.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    pub fn find(&self, name: &str) -> Option<StreamId> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.as_ref().filter(|e| e.name == name).map(|e| StreamId {
                index,
                generation: e.generation,
            })
        })
    }

    pub fn entry(&self, id: StreamId) -> Option<&StreamEntry> {
        self.slots
            .get(id.index)?
            .as_ref()
            .filter(|e| e.generation == id.generation)
    }

    pub fn entry_mut(&mut self, id: StreamId) -> Option<&mut StreamEntry> {
        self.slots
            .get_mut(id.index)?
            .as_mut()
            .filter(|e| e.generation == id.generation)
    }

    /// Creates a new stream: header written (truncating any stale file of the
    /// same name), rule table opened, status document refreshed.
    pub fn create(&mut self, name: &str, description: &str, replay: bool) -> Result<StreamId> {
        if name.is_empty() || name.contains(['/', '\0']) {
            return Err(StreamError::Parse(format!("invalid stream name {name:?}")));
        }
        if self.find(name).is_some() {
            return Err(StreamError::DuplicateStream(name.to_string()));
        }

        let path = self.dir.join(format!("{name}.events"));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(FILE_MODE)
            .open(&path)?;
        let _ = file.set_permissions(Permissions::from_mode(FILE_MODE));

        let header = StreamHeader {
            name: name.to_string(),
            description: description.to_string(),
            replay,
            created: now_epoch(),
        };
        let data_offset = codec::write_header(&mut file, &header)?;
        let rules = RuleTable::open(&self.dir, name)?;

        let id = self.push(StreamEntry {
            generation: 0, // assigned by push
            name: header.name,
            description: header.description,
            replay: header.replay,
            created: header.created,
            file,
            data_offset,
            rules,
        });
        self.rebuild_status();
        info!(stream = name, replay, "created notification stream");
        Ok(id)
    }

    /// Appends `event` to the stream's allowlist. The registry lock the
    /// caller already holds serializes concurrent appenders in this process.
    pub fn allow(&mut self, id: StreamId, event: &str) -> Result<()> {
        match self.entry_mut(id) {
            Some(entry) => entry.rules.allow(event),
            None => Err(StreamError::Gone),
        }
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        self.slots
            .iter()
            .flatten()
            .map(|e| StreamInfo {
                name: e.name.clone(),
                description: e.description.clone(),
                replay: e.replay,
                created: e.created,
            })
            .collect()
    }

    pub fn status(&self) -> String {
        self.status.clone()
    }

    pub fn slots(&self) -> impl Iterator<Item = (StreamId, &StreamEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref().map(|e| {
                (
                    StreamId {
                        index,
                        generation: e.generation,
                    },
                    e,
                )
            })
        })
    }

    fn scan(&mut self) -> Result<()> {
        for dirent in fs::read_dir(&self.dir)? {
            let Ok(dirent) = dirent else { continue };
            let path = dirent.path();
            match dirent.metadata() {
                Ok(md) if md.is_file() => {}
                _ => continue,
            }
            match codec::read_header(&path) {
                Ok(Some(opened)) => {
                    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                    if opened.header.name != stem {
                        warn!(
                            file = %path.display(),
                            stream = %opened.header.name,
                            "stream file name does not match its header; skipping"
                        );
                        continue;
                    }
                    if self.find(&opened.header.name).is_some() {
                        continue;
                    }
                    if let Err(err) = self.insert(opened) {
                        warn!(file = %path.display(), %err, "failed to register stream");
                    }
                }
                // Not a stream file (rule tables share the directory).
                Ok(None) => {}
                Err(err) => {
                    warn!(file = %path.display(), %err, "unreadable stream file; skipping");
                }
            }
        }
        Ok(())
    }

    fn insert(&mut self, opened: codec::OpenedStream) -> Result<StreamId> {
        let rules = RuleTable::open(&self.dir, &opened.header.name)?;
        let id = self.push(StreamEntry {
            generation: 0,
            name: opened.header.name,
            description: opened.header.description,
            replay: opened.header.replay,
            created: opened.header.created,
            file: opened.file,
            data_offset: opened.data_offset,
            rules,
        });
        self.rebuild_status();
        Ok(id)
    }

    fn push(&mut self, mut entry: StreamEntry) -> StreamId {
        entry.generation = self.next_generation;
        self.next_generation += 1;
        let generation = entry.generation;
        let index = self.slots.len();
        self.slots.push(Some(entry));
        StreamId { index, generation }
    }

    fn rebuild_status(&mut self) {
        let mut doc = format!("<netconf xmlns=\"{}\"><streams>", xml::NETMOD_NS);
        for entry in self.slots.iter().flatten() {
            doc.push_str("<stream>");
            doc.push_str(&format!("<name>{}</name>", xml::escape(&entry.name)));
            doc.push_str(&format!(
                "<description>{}</description>",
                xml::escape(&entry.description)
            ));
            doc.push_str(&format!(
                "<replaySupport>{}</replaySupport>",
                entry.replay
            ));
            if entry.replay {
                doc.push_str(&format!(
                    "<replayLogCreationTime>{}</replayLogCreationTime>",
                    xml::epoch_to_iso(entry.created)
                ));
            }
            doc.push_str("</stream>");
        }
        doc.push_str("</streams></netconf>");
        self.status = doc;
    }
}

pub(crate) fn now_epoch() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs(),
        Err(_) => 0,
    }
}
