// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Construction and fan-out of notification records.
//!
//! Publish is advisory, not transactional: once the XML payload is built,
//! per-stream disk appends and bus broadcasts fail soft (logged, never
//! surfaced to the caller).

use netconf_common::locks::FileLock;
use tracing::warn;

use crate::bus::Bus;
use crate::codec;
use crate::error::Result;
use crate::registry::{now_epoch, Registry};
use crate::xml;

/// Session attributes carried by the RFC 6470 session events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub username: String,
    pub session_id: u32,
    pub source_host: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datastore {
    Running,
    Startup,
    Candidate,
}

impl Datastore {
    fn as_str(self) -> &'static str {
        match self {
            Datastore::Running => "running",
            Datastore::Startup => "startup",
            Datastore::Candidate => "candidate",
        }
    }
}

/// Who caused a configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangedBy {
    Server,
    Session(SessionMeta),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Closed,
    Killed,
    Dropped,
    Timeout,
    BadHello,
    Other,
}

impl TerminationReason {
    fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Closed => "closed",
            TerminationReason::Killed => "killed",
            TerminationReason::Dropped => "dropped",
            TerminationReason::Timeout => "timeout",
            TerminationReason::BadHello => "bad-hello",
            TerminationReason::Other => "other",
        }
    }
}

/// The payloads the engine can publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller-supplied XML body, wrapped as-is.
    Generic { body: String },
    ConfigChange {
        datastore: Datastore,
        by: ChangedBy,
    },
    /// Capability lists before and after; the diff is published.
    CapabilityChange {
        old: Vec<String>,
        new: Vec<String>,
    },
    SessionStart(SessionMeta),
    SessionEnd {
        meta: SessionMeta,
        reason: TerminationReason,
        killed_by: Option<u32>,
    },
}

impl Event {
    /// The event name this payload is routed by: the local name of the body
    /// element.
    pub fn event_name(&self) -> Result<String> {
        match self {
            Event::Generic { body } => xml::first_element_name(body),
            Event::ConfigChange { .. } => Ok("netconf-config-change".into()),
            Event::CapabilityChange { .. } => Ok("netconf-capability-change".into()),
            Event::SessionStart(_) => Ok("netconf-session-start".into()),
            Event::SessionEnd { .. } => Ok("netconf-session-end".into()),
        }
    }

    /// Canonical XML body for this payload.
    pub fn body(&self) -> Result<String> {
        match self {
            Event::Generic { body } => {
                // The one place a caller hands us markup; reject garbage
                // before it reaches any stream file.
                xml::first_element_name(body)?;
                Ok(body.clone())
            }
            Event::ConfigChange { datastore, by } => {
                let mut b = String::from("<netconf-config-change>");
                b.push_str(&format!("<datastore>{}</datastore>", datastore.as_str()));
                match by {
                    ChangedBy::Server => b.push_str("<server/>"),
                    ChangedBy::Session(meta) => push_session_meta(&mut b, meta),
                }
                b.push_str("</netconf-config-change>");
                Ok(b)
            }
            Event::CapabilityChange { old, new } => {
                let mut b = String::from("<netconf-capability-change>");
                for cap in new {
                    match old.iter().find(|o| identity(o) == identity(cap)) {
                        None => b.push_str(&format!(
                            "<added-capability>{}</added-capability>",
                            xml::escape(cap)
                        )),
                        Some(o) if o != cap => b.push_str(&format!(
                            "<modified-capability>{}</modified-capability>",
                            xml::escape(cap)
                        )),
                        Some(_) => {}
                    }
                }
                for cap in old {
                    if !new.iter().any(|n| identity(n) == identity(cap)) {
                        b.push_str(&format!(
                            "<deleted-capability>{}</deleted-capability>",
                            xml::escape(cap)
                        ));
                    }
                }
                b.push_str("</netconf-capability-change>");
                Ok(b)
            }
            Event::SessionStart(meta) => {
                let mut b = String::from("<netconf-session-start>");
                push_session_meta(&mut b, meta);
                b.push_str("</netconf-session-start>");
                Ok(b)
            }
            Event::SessionEnd {
                meta,
                reason,
                killed_by,
            } => {
                let mut b = String::from("<netconf-session-end>");
                push_session_meta(&mut b, meta);
                b.push_str(&format!(
                    "<termination-reason>{}</termination-reason>",
                    reason.as_str()
                ));
                if let Some(sid) = killed_by {
                    b.push_str(&format!("<killed-by>{sid}</killed-by>"));
                }
                b.push_str("</netconf-session-end>");
                Ok(b)
            }
        }
    }
}

fn push_session_meta(b: &mut String, meta: &SessionMeta) {
    b.push_str(&format!(
        "<username>{}</username>",
        xml::escape(&meta.username)
    ));
    b.push_str(&format!("<session-id>{}</session-id>", meta.session_id));
    if let Some(host) = &meta.source_host {
        b.push_str(&format!(
            "<source-host>{}</source-host>",
            xml::escape(host)
        ));
    }
}

/// A capability's identity is its URI up to the `?` of any parameter list.
fn identity(cap: &str) -> &str {
    cap.split('?').next().unwrap_or(cap)
}

/// Builds the envelope, appends it to every allowed replay log, and
/// broadcasts it to every allowed stream's subscribers.
///
/// Returns the envelope that was published. Only payload construction can
/// fail hard.
pub(crate) fn publish(
    registry: &Registry,
    bus: &Bus,
    event_time: Option<u64>,
    event: &Event,
) -> Result<String> {
    let time = event_time.unwrap_or_else(now_epoch);
    let name = event.event_name()?;
    let body = event.body()?;
    let envelope = xml::envelope(&xml::epoch_to_iso(time), &body);

    let targets = registry.with_inner(|inner| {
        let mut targets = Vec::new();
        for (_, entry) in inner.slots() {
            if !entry.rules.contains(&name) {
                continue;
            }
            if entry.replay {
                match FileLock::exclusive(&entry.file) {
                    Ok(_lock) => {
                        // append_record truncates back itself on a torn write.
                        if let Err(err) =
                            codec::append_record(&entry.file, time, envelope.as_bytes())
                        {
                            warn!(stream = %entry.name, %err, "failed to append record");
                        }
                    }
                    Err(err) => {
                        warn!(stream = %entry.name, %err, "could not lock events file");
                    }
                }
            }
            targets.push(entry.name.clone());
        }
        Ok(targets)
    })?;

    // Broadcast outside the registry lock; send never blocks.
    for stream in &targets {
        if let Err(err) = bus.send(stream, time, &envelope) {
            warn!(stream = %stream, %err, "bus broadcast failed");
        }
    }
    Ok(envelope)
}
