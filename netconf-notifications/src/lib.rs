// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistent multi-producer / multi-consumer notification streams for a
//! NETCONF server (RFC 5277 / RFC 6470).
//!
//! Server processes on one host publish structured events into named
//! streams backed by append-only log files; subscribers replay the history
//! that matches their time window and then follow live events fanned out
//! over a host-local bus, separated by a single `<replayComplete/>`
//! sentinel.
//!
//! All operations hang off an explicitly constructed [`NotificationEngine`];
//! there is no process-global state.

pub mod bus;
pub mod codec;
pub mod dir;
pub mod dispatch;
pub mod error;
pub mod publish;
pub mod registry;
pub mod request;
pub mod rules;
pub mod subscription;
pub mod xml;

use std::path::{Path, PathBuf};

pub use error::{Result, StreamError};
pub use publish::{ChangedBy, Datastore, Event, SessionMeta, TerminationReason};
pub use registry::{StreamInfo, BASE_EVENTS, BASE_STREAM};
pub use request::{RpcError, SubscriptionRequest, ValidationError};
pub use subscription::{Delivery, Polled, Subscription};

use registry::Registry;

/// Handle to one process's view of the notification subsystem.
pub struct NotificationEngine {
    dir: PathBuf,
    registry: Registry,
    bus: bus::Bus,
}

impl NotificationEngine {
    /// Opens the engine on the directory named by `LIBNETCONF_STREAMS` (or
    /// the compiled default), creating it and the base `NETCONF` stream as
    /// needed.
    pub fn init() -> Result<NotificationEngine> {
        NotificationEngine::with_dir(dir::streams_dir()?)
    }

    /// Opens the engine on an explicit streams directory.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Result<NotificationEngine> {
        let dir = dir.into();
        dir::ensure_dir(&dir)?;
        let registry = Registry::init(dir.clone())?;
        let bus = bus::Bus::new(&dir);
        Ok(NotificationEngine { dir, registry, bus })
    }

    pub fn streams_dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Tears the engine down: every live iterator observes the end of its
    /// stream on its next call.
    pub fn close(&self) {
        self.registry.close();
        self.bus.close();
    }

    /// Creates a stream. Its events file and rule table appear on disk
    /// immediately; other processes discover it lazily by name.
    pub fn create_stream(&self, name: &str, description: &str, replay: bool) -> Result<()> {
        self.registry
            .with_inner(|inner| inner.create(name, description, replay).map(|_| ()))
    }

    /// Adds `event` to `stream`'s allowlist.
    pub fn allow_event(&self, stream: &str, event: &str) -> Result<()> {
        self.registry.with_inner(|inner| {
            let id = inner.get_or_probe(stream)?;
            inner.allow(id, event)
        })
    }

    /// Publishes one event: the envelope is appended to every allowed
    /// replay log and broadcast to every allowed stream's subscribers.
    /// Returns the published envelope.
    pub fn publish(&self, event_time: Option<u64>, event: &Event) -> Result<String> {
        publish::publish(&self.registry, &self.bus, event_time, event)
    }

    /// Opens a subscriber cursor on `stream` with an optional replay window.
    pub fn subscribe(
        &self,
        stream: &str,
        start: Option<u64>,
        stop: Option<u64>,
    ) -> Result<Subscription<'_>> {
        Subscription::new(&self.registry, &self.dir, stream, start, stop)
    }

    /// The serialized stream-status document.
    pub fn status(&self) -> Result<String> {
        self.registry.with_inner(|inner| Ok(inner.status()))
    }

    /// Snapshot of the registered streams.
    pub fn streams(&self) -> Result<Vec<StreamInfo>> {
        self.registry.with_inner(|inner| Ok(inner.streams()))
    }
}

impl std::fmt::Debug for NotificationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationEngine")
            .field("dir", &self.dir)
            .finish()
    }
}
