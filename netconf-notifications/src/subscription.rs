// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-subscriber cursor over one stream: replay of the on-disk log first,
//! one `<replayComplete/>`, then live signals from the bus.
//!
//! Ordering contract: every replay record precedes the `replayComplete`
//! sentinel and live records follow it in bus arrival order. The bus
//! registration is taken at cursor creation, so a record published while
//! replay is still reading the log is seen at most twice (file and queued
//! signal) and never lost.

use std::time::Duration;

use netconf_common::locks::FileLock;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::codec;
use crate::error::{Result, StreamError};
use crate::registry::{now_epoch, Registry, StreamId};
use crate::xml;

/// Bound on one live-phase bus wait, so shutdown and stop times are observed
/// promptly.
pub const LIVE_POLL_QUANTUM: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Replay,
    Live,
    Done,
}

/// One item produced by the iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A stream record, replayed or live.
    Event { event_time: u64, xml: String },
    /// The synthesized end-of-replay notification.
    ReplayComplete { event_time: u64, xml: String },
}

impl Delivery {
    pub fn xml(&self) -> &str {
        match self {
            Delivery::Event { xml, .. } => xml,
            Delivery::ReplayComplete { xml, .. } => xml,
        }
    }

    pub fn event_time(&self) -> u64 {
        match self {
            Delivery::Event { event_time, .. } => *event_time,
            Delivery::ReplayComplete { event_time, .. } => *event_time,
        }
    }
}

/// Outcome of one bounded-time poll.
#[derive(Debug)]
pub enum Polled {
    Delivered(Delivery),
    /// Nothing arrived within the quantum; poll again.
    Idle,
    /// Stop reached, bus closed, or registry torn down.
    Finished,
}

enum ReplayStep {
    Skip(u64),
    Record { time: u64, xml: Vec<u8>, next: u64 },
    PastStop,
    End,
}

/// A single subscriber's cursor. Owned by the dispatcher that created it.
pub struct Subscription<'a> {
    registry: &'a Registry,
    bus: Bus,
    id: StreamId,
    stream: String,
    start: Option<u64>,
    stop: Option<u64>,
    phase: Phase,
    offset: u64,
}

impl<'a> Subscription<'a> {
    pub(crate) fn new(
        registry: &'a Registry,
        streams_dir: &std::path::Path,
        stream: &str,
        start: Option<u64>,
        stop: Option<u64>,
    ) -> Result<Subscription<'a>> {
        let id = registry.with_inner(|inner| inner.get_or_probe(stream))?;
        let offset = registry.with_stream(id, |entry| Ok(entry.data_offset))?;

        // Subscribe before replay starts so no record published while we
        // read the log can fall between the two phases.
        let bus = Bus::new(streams_dir);
        bus.subscribe(stream)?;

        let phase = if start.is_some() {
            Phase::Replay
        } else {
            // No start time means no replay, and no replayComplete either.
            Phase::Live
        };
        Ok(Subscription {
            registry,
            bus,
            id,
            stream: stream.to_string(),
            start,
            stop,
            phase,
            offset,
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Produces the next item, waiting at most `quantum` on the bus.
    pub fn poll(&mut self, quantum: Duration) -> Polled {
        loop {
            match self.phase {
                Phase::Done => return Polled::Finished,
                Phase::Replay => match self.replay_step() {
                    Ok(Some(polled)) => return polled,
                    Ok(None) => continue,
                    Err(err) => {
                        debug!(stream = %self.stream, %err, "replay ended by error");
                        self.phase = Phase::Done;
                        return Polled::Finished;
                    }
                },
                Phase::Live => return self.live_step(quantum),
            }
        }
    }

    /// Blocking form of [`poll`](Self::poll): the next record, sentinel, or
    /// `None` once the subscription is over.
    pub fn next(&mut self) -> Option<Delivery> {
        loop {
            match self.poll(LIVE_POLL_QUANTUM) {
                Polled::Delivered(delivery) => return Some(delivery),
                Polled::Idle => continue,
                Polled::Finished => return None,
            }
        }
    }

    fn replay_step(&mut self) -> Result<Option<Polled>> {
        let start = self.start.unwrap_or(0);
        let stop = self.stop;
        let offset = self.offset;

        let step = self.registry.with_stream(self.id, |entry| {
            if !entry.replay {
                return Ok(ReplayStep::End);
            }
            let _lock = FileLock::exclusive(&entry.file).map_err(StreamError::Lock)?;
            match codec::peek_record(&entry.file, offset)? {
                None => Ok(ReplayStep::End),
                Some(meta) if meta.event_time < start => {
                    Ok(ReplayStep::Skip(meta.next_offset(offset)))
                }
                Some(meta) if stop.is_some_and(|s| meta.event_time > s) => {
                    Ok(ReplayStep::PastStop)
                }
                Some(meta) => {
                    let xml = codec::read_record_xml(&entry.file, offset, meta)?;
                    Ok(ReplayStep::Record {
                        time: meta.event_time,
                        xml,
                        next: meta.next_offset(offset),
                    })
                }
            }
        })?;

        Ok(match step {
            ReplayStep::Skip(next) => {
                self.offset = next;
                None
            }
            ReplayStep::Record { time, xml, next } => {
                self.offset = next;
                match String::from_utf8(xml) {
                    Ok(xml) => Some(Polled::Delivered(Delivery::Event {
                        event_time: time,
                        xml,
                    })),
                    Err(_) => {
                        warn!(stream = %self.stream, "skipping non-UTF-8 record");
                        None
                    }
                }
            }
            ReplayStep::PastStop => {
                self.phase = Phase::Done;
                Some(Polled::Finished)
            }
            ReplayStep::End => Some(self.emit_replay_complete()),
        })
    }

    fn emit_replay_complete(&mut self) -> Polled {
        let now = now_epoch();
        self.phase = Phase::Live;
        Polled::Delivered(Delivery::ReplayComplete {
            event_time: now,
            xml: xml::replay_complete(&xml::epoch_to_iso(now)),
        })
    }

    fn live_step(&mut self, quantum: Duration) -> Polled {
        if self.stop.is_some_and(|stop| now_epoch() > stop) {
            self.phase = Phase::Done;
            return Polled::Finished;
        }
        // A torn-down registry ends the subscription on the next call.
        if self.registry.with_stream(self.id, |_| Ok(())).is_err() {
            self.phase = Phase::Done;
            return Polled::Finished;
        }

        match self.bus.recv(quantum) {
            Ok(None) => Polled::Idle,
            Err(err) => {
                debug!(stream = %self.stream, %err, "live phase ended");
                self.phase = Phase::Done;
                Polled::Finished
            }
            Ok(Some(signal)) => {
                if signal.stream != self.stream {
                    return Polled::Idle;
                }
                if self.stop.is_some_and(|stop| signal.event_time > stop) {
                    self.phase = Phase::Done;
                    return Polled::Finished;
                }
                if self.start.is_some_and(|s| signal.event_time < s) {
                    return Polled::Idle;
                }
                if xml::parse_envelope(&signal.xml).is_err() {
                    warn!(stream = %self.stream, "skipping malformed live signal");
                    return Polled::Idle;
                }
                Polled::Delivered(Delivery::Event {
                    event_time: signal.event_time,
                    xml: signal.xml,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::{publish, Event};
    use crate::registry::Registry;

    fn engine(dir: &std::path::Path) -> (Registry, Bus) {
        let registry = Registry::init(dir.to_path_buf()).unwrap();
        let bus = Bus::new(dir);
        (registry, bus)
    }

    fn seed(registry: &Registry, bus: &Bus, times: &[u64]) {
        registry
            .with_inner(|inner| {
                let id = inner.create("test", "test stream", true)?;
                inner.allow(id, "thing-happened")
            })
            .unwrap();
        for &t in times {
            publish(
                registry,
                bus,
                Some(t),
                &Event::Generic {
                    body: format!("<thing-happened><at>{t}</at></thing-happened>"),
                },
            )
            .unwrap();
        }
    }

    #[test]
    fn test_replay_then_replay_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, bus) = engine(tmp.path());
        seed(&registry, &bus, &[100, 200, 300]);

        let mut sub = Subscription::new(&registry, tmp.path(), "test", Some(1), None).unwrap();
        for expected in [100, 200, 300] {
            match sub.next().unwrap() {
                Delivery::Event { event_time, xml } => {
                    assert_eq!(event_time, expected);
                    assert!(xml.contains(&format!("<at>{expected}</at>")));
                }
                other => panic!("expected record, got {other:?}"),
            }
        }
        match sub.next().unwrap() {
            Delivery::ReplayComplete { xml, .. } => {
                assert!(xml.contains("<replayComplete/>"))
            }
            other => panic!("expected replayComplete, got {other:?}"),
        }
        // Live phase with nothing on the bus.
        assert!(matches!(sub.poll(Duration::from_millis(5)), Polled::Idle));
    }

    #[test]
    fn test_start_time_skips_older_records() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, bus) = engine(tmp.path());
        seed(&registry, &bus, &[100, 200, 300]);

        let mut sub =
            Subscription::new(&registry, tmp.path(), "test", Some(250), None).unwrap();
        match sub.next().unwrap() {
            Delivery::Event { event_time, .. } => assert_eq!(event_time, 300),
            other => panic!("expected record, got {other:?}"),
        }
        assert!(matches!(
            sub.next().unwrap(),
            Delivery::ReplayComplete { .. }
        ));
    }

    #[test]
    fn test_stop_time_ends_replay() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, bus) = engine(tmp.path());
        seed(&registry, &bus, &[100, 200, 300]);

        let mut sub =
            Subscription::new(&registry, tmp.path(), "test", Some(1), Some(250)).unwrap();
        assert_eq!(sub.next().unwrap().event_time(), 100);
        assert_eq!(sub.next().unwrap().event_time(), 200);
        // 300 is past stop: subscription is over, no replayComplete.
        assert!(sub.next().is_none());
    }

    #[test]
    fn test_no_start_time_means_no_replay() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, bus) = engine(tmp.path());
        seed(&registry, &bus, &[100]);

        let mut sub = Subscription::new(&registry, tmp.path(), "test", None, None).unwrap();
        // Straight to live: the replayed record is not delivered and no
        // replayComplete is synthesized.
        assert!(matches!(sub.poll(Duration::from_millis(5)), Polled::Idle));
    }

    #[test]
    fn test_unknown_stream_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, _) = engine(tmp.path());
        match Subscription::new(&registry, tmp.path(), "noSuch", Some(1), None) {
            Err(StreamError::UnknownStream(name)) => assert_eq!(name, "noSuch"),
            Err(other) => panic!("expected UnknownStream, got {other:?}"),
            Ok(_) => panic!("subscription to a missing stream succeeded"),
        }
    }

    #[test]
    fn test_registry_close_finishes_live_subscription() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, bus) = engine(tmp.path());
        seed(&registry, &bus, &[]);

        let mut sub = Subscription::new(&registry, tmp.path(), "test", None, None).unwrap();
        registry.close();
        assert!(sub.next().is_none());
    }
}
