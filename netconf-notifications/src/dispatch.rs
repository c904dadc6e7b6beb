// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-session notification dispatchers.
//!
//! The send dispatcher drives a subscription iterator on a session, applies
//! the subscription filter, and frames surviving records for the session
//! writer; the receive dispatcher decodes incoming notifications and hands
//! them to a callback. Both own the session's `ntf_active` flag for their
//! lifetime and poll the session state so an external close terminates them.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, StreamError};
use crate::registry::now_epoch;
use crate::request::{validate, RpcError, ValidationError};
use crate::subscription::{Delivery, Polled, LIVE_POLL_QUANTUM};
use crate::xml;
use crate::NotificationEngine;

/// The narrow slice of a NETCONF session the dispatchers need.
pub trait Session {
    fn id(&self) -> u32;
    /// Whether the session is in the working state; polled between quanta.
    fn is_working(&self) -> bool;
    /// Whether the session advertised the notification capability.
    fn supports_notifications(&self) -> bool;
    /// The at-most-one-dispatcher-per-session flag.
    fn ntf_active(&self) -> &AtomicBool;
    /// Hands one framed notification to the session transport.
    fn send_frame(&self, xml: &str) -> io::Result<()>;
    /// Next inbound notification frame, or `None` within `timeout`.
    fn recv_frame(&self, timeout: Duration) -> io::Result<Option<String>>;
}

/// Opaque evaluator for subscription filters: does `element` pass `filter`?
pub trait FilterEval {
    fn matches(&self, filter: &str, element: &str) -> bool;
}

/// Evaluator that keeps every element; used when no real filter engine is
/// wired in.
#[derive(Debug, Default)]
pub struct PassAll;

impl FilterEval for PassAll {
    fn matches(&self, _filter: &str, _element: &str) -> bool {
        true
    }
}

/// Why a dispatcher refused to run or stopped with an error.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("session is not in the working state")]
    SessionNotWorking,
    #[error("session does not advertise the notification capability")]
    NoNotificationCapability,
    #[error("a notification dispatcher is already active on this session")]
    AlreadyActive,
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("session transport: {0}")]
    Transport(#[from] io::Error),
}

impl DispatchError {
    /// Protocol error for the RPC reply; only validation failures carry a
    /// specific mapping, everything else is `operation-failed`.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            DispatchError::Invalid(err) => err.to_rpc_error(),
            other => RpcError {
                tag: "operation-failed",
                element: None,
                message: Some(other.to_string()),
            },
        }
    }
}

/// Kinds a decoded notification can classify as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ConfigChange,
    CapabilityChange,
    SessionStart,
    SessionEnd,
    ConfirmedCommit,
    ReplayComplete,
    NotificationComplete,
    Generic,
}

/// Maps an event name (the first non-`eventTime` child's local name) to its
/// kind.
pub fn classify(event_name: &str) -> EventKind {
    match event_name {
        "netconf-config-change" => EventKind::ConfigChange,
        "netconf-capability-change" => EventKind::CapabilityChange,
        "netconf-session-start" => EventKind::SessionStart,
        "netconf-session-end" => EventKind::SessionEnd,
        // Older publishers shipped the misspelled form; keep decoding it.
        "netconf-confirmed-commit" | "netconf-configrmed-commit" => EventKind::ConfirmedCommit,
        "replayComplete" => EventKind::ReplayComplete,
        "notificationComplete" => EventKind::NotificationComplete,
        _ => EventKind::Generic,
    }
}

/// A notification decoded from the wire.
#[derive(Debug, Clone)]
pub struct Received {
    event_time: u64,
    event_time_iso: String,
    body: String,
    kind: EventKind,
}

impl Received {
    pub fn decode(frame: &str) -> Result<Received> {
        let envelope = xml::parse_envelope(frame)?;
        let event_time = envelope
            .event_time
            .ok_or_else(|| StreamError::Parse("unparsable eventTime".into()))?;
        let kind = envelope
            .event_name
            .as_deref()
            .map(classify)
            .unwrap_or(EventKind::Generic);
        Ok(Received {
            event_time,
            event_time_iso: envelope.event_time_iso,
            body: envelope.children.concat(),
            kind,
        })
    }

    pub fn event_time(&self) -> u64 {
        self.event_time
    }

    pub fn event_time_iso(&self) -> &str {
        &self.event_time_iso
    }

    /// The body content, `eventTime` excluded.
    pub fn content(&self) -> &str {
        &self.body
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// RAII ownership of a session's `ntf_active` flag.
struct ActiveGuard<'s> {
    session: &'s dyn Session,
}

impl<'s> ActiveGuard<'s> {
    fn acquire(session: &'s dyn Session) -> std::result::Result<Self, DispatchError> {
        if session
            .ntf_active()
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DispatchError::AlreadyActive);
        }
        Ok(ActiveGuard { session })
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.session.ntf_active().store(false, Ordering::Release);
    }
}

/// Runs a subscription on `session` until its stop time, the session leaving
/// the working state, or engine teardown; then sends
/// `<notificationComplete/>`.
pub fn dispatch_send(
    engine: &NotificationEngine,
    session: &dyn Session,
    rpc: &str,
    filter_eval: &dyn FilterEval,
) -> std::result::Result<(), DispatchError> {
    if !session.is_working() {
        return Err(DispatchError::SessionNotWorking);
    }
    if !session.supports_notifications() {
        return Err(DispatchError::NoNotificationCapability);
    }
    let _active = ActiveGuard::acquire(session)?;

    let request = validate(rpc, engine, now_epoch())?;
    let mut subscription =
        engine.subscribe(&request.stream, request.start, request.stop)?;

    while session.is_working() {
        match subscription.poll(LIVE_POLL_QUANTUM) {
            Polled::Idle => continue,
            Polled::Finished => break,
            Polled::Delivered(delivery) => {
                let frame = match (&request.filter, &delivery) {
                    // The replay sentinel is never filtered away.
                    (Some(filter), Delivery::Event { xml, .. }) => {
                        apply_filter(filter_eval, filter, xml)
                    }
                    _ => Some(delivery.xml().to_string()),
                };
                if let Some(frame) = frame {
                    session.send_frame(&frame)?;
                }
            }
        }
    }

    let complete = xml::notification_complete(&xml::epoch_to_iso(now_epoch()));
    if let Err(err) = session.send_frame(&complete) {
        // The session may be gone already; ending the subscription cleanly
        // still counts.
        warn!(session = session.id(), %err, "could not send notificationComplete");
    }
    Ok(())
}

/// Re-frames `xml` with only the body children the filter keeps, or `None`
/// when nothing survives (the record is skipped).
fn apply_filter(filter_eval: &dyn FilterEval, filter: &str, xml: &str) -> Option<String> {
    let envelope = match xml::parse_envelope(xml) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(%err, "skipping unparsable record during filtering");
            return None;
        }
    };
    let surviving: Vec<&String> = envelope
        .children
        .iter()
        .filter(|child| filter_eval.matches(filter, child))
        .collect();
    if surviving.is_empty() {
        return None;
    }
    let body: String = surviving.into_iter().map(String::as_str).collect();
    Some(xml::envelope(&envelope.event_time_iso, &body))
}

/// Consumes notifications from `session` until `<notificationComplete/>` or
/// the session leaves the working state.
///
/// Without a callback, each notification is printed as
/// `eventTime: <iso>` followed by the body.
pub fn dispatch_receive(
    session: &dyn Session,
    callback: Option<&dyn Fn(u64, &str)>,
) -> std::result::Result<(), DispatchError> {
    let _active = ActiveGuard::acquire(session)?;

    while session.is_working() {
        let frame = match session.recv_frame(LIVE_POLL_QUANTUM) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err) => {
                warn!(session = session.id(), %err, "notification receive failed");
                break;
            }
        };
        let received = match Received::decode(&frame) {
            Ok(received) => received,
            Err(err) => {
                warn!(session = session.id(), %err, "skipping malformed notification");
                continue;
            }
        };
        if received.kind() == EventKind::NotificationComplete {
            break;
        }
        match callback {
            Some(callback) => callback(received.event_time(), received.content()),
            None => println!(
                "eventTime: {}\n{}",
                received.event_time_iso(),
                received.content()
            ),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use netconf_common::MutexExt;

    struct MockSession {
        working: AtomicBool,
        caps: bool,
        ntf: AtomicBool,
        sent: Mutex<Vec<String>>,
        inbox: Mutex<VecDeque<String>>,
        /// Stop reporting the working state after this many sent frames.
        hangup_after: Option<usize>,
    }

    impl MockSession {
        fn new() -> MockSession {
            MockSession {
                working: AtomicBool::new(true),
                caps: true,
                ntf: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
                inbox: Mutex::new(VecDeque::new()),
                hangup_after: None,
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock_or_panic().clone()
        }
    }

    impl Session for MockSession {
        fn id(&self) -> u32 {
            1
        }

        fn is_working(&self) -> bool {
            if let Some(limit) = self.hangup_after {
                if self.sent.lock_or_panic().len() >= limit {
                    return false;
                }
            }
            self.working.load(Ordering::Acquire)
        }

        fn supports_notifications(&self) -> bool {
            self.caps
        }

        fn ntf_active(&self) -> &AtomicBool {
            &self.ntf
        }

        fn send_frame(&self, xml: &str) -> io::Result<()> {
            self.sent.lock_or_panic().push(xml.to_string());
            Ok(())
        }

        fn recv_frame(&self, _timeout: Duration) -> io::Result<Option<String>> {
            Ok(self.inbox.lock_or_panic().pop_front())
        }
    }

    fn engine_with_stream(dir: &std::path::Path) -> NotificationEngine {
        let engine = NotificationEngine::with_dir(dir).unwrap();
        engine.create_stream("test", "test stream", true).unwrap();
        engine.allow_event("test", "thing-happened").unwrap();
        engine
    }

    fn generic(body: &str) -> crate::Event {
        crate::Event::Generic {
            body: body.to_string(),
        }
    }

    #[test]
    fn test_classify_known_names() {
        assert_eq!(classify("netconf-config-change"), EventKind::ConfigChange);
        assert_eq!(classify("netconf-session-start"), EventKind::SessionStart);
        assert_eq!(
            classify("netconf-confirmed-commit"),
            EventKind::ConfirmedCommit
        );
        // The historical misspelling decodes to the same kind.
        assert_eq!(
            classify("netconf-configrmed-commit"),
            EventKind::ConfirmedCommit
        );
        assert_eq!(classify("replayComplete"), EventKind::ReplayComplete);
        assert_eq!(
            classify("notificationComplete"),
            EventKind::NotificationComplete
        );
        assert_eq!(classify("link-down"), EventKind::Generic);
    }

    #[test]
    fn test_send_dispatcher_replays_and_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with_stream(tmp.path());
        engine
            .publish(Some(100), &generic("<thing-happened><n>1</n></thing-happened>"))
            .unwrap();
        engine
            .publish(Some(200), &generic("<thing-happened><n>2</n></thing-happened>"))
            .unwrap();

        let mut session = MockSession::new();
        // Two records + replayComplete, then the session goes away.
        session.hangup_after = Some(3);

        let rpc = format!(
            "<create-subscription xmlns=\"{}\"><stream>test</stream>\
             <startTime>1970-01-01T00:00:01Z</startTime></create-subscription>",
            xml::NOTIFICATION_NS
        );
        dispatch_send(&engine, &session, &rpc, &PassAll).unwrap();

        let sent = session.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent[0].contains("<n>1</n>"));
        assert!(sent[1].contains("<n>2</n>"));
        assert!(sent[2].contains("<replayComplete/>"));
        assert!(sent[3].contains("<notificationComplete/>"));
        assert!(!session.ntf_active().load(Ordering::Acquire));
    }

    #[test]
    fn test_send_dispatcher_applies_filter() {
        struct KeepMarked;
        impl FilterEval for KeepMarked {
            fn matches(&self, _filter: &str, element: &str) -> bool {
                element.contains("keep")
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with_stream(tmp.path());
        engine
            .publish(Some(100), &generic("<thing-happened><keep/><drop/></thing-happened>"))
            .unwrap();
        engine
            .publish(Some(200), &generic("<thing-happened><drop/></thing-happened>"))
            .unwrap();

        let mut session = MockSession::new();
        // One filtered record + replayComplete.
        session.hangup_after = Some(2);

        let rpc = format!(
            "<create-subscription xmlns=\"{}\"><stream>test</stream>\
             <startTime>1970-01-01T00:00:01Z</startTime>\
             <filter type=\"subtree\"><thing-happened/></filter>\
             </create-subscription>",
            xml::NOTIFICATION_NS
        );
        dispatch_send(&engine, &session, &rpc, &KeepMarked).unwrap();

        let sent = session.sent();
        assert_eq!(sent.len(), 3);
        // The record with a surviving child went out; the all-dropped one
        // was skipped entirely.
        assert!(sent[0].contains("keep"));
        assert!(!sent[1].contains("drop"));
        assert!(sent[1].contains("<replayComplete/>"));
        assert!(sent[2].contains("<notificationComplete/>"));
    }

    #[test]
    fn test_send_dispatcher_guards() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with_stream(tmp.path());
        let rpc = "<create-subscription/>";

        let session = MockSession::new();
        session.working.store(false, Ordering::Release);
        assert!(matches!(
            dispatch_send(&engine, &session, rpc, &PassAll),
            Err(DispatchError::SessionNotWorking)
        ));

        let mut session = MockSession::new();
        session.caps = false;
        assert!(matches!(
            dispatch_send(&engine, &session, rpc, &PassAll),
            Err(DispatchError::NoNotificationCapability)
        ));

        let session = MockSession::new();
        session.ntf.store(true, Ordering::Release);
        assert!(matches!(
            dispatch_send(&engine, &session, rpc, &PassAll),
            Err(DispatchError::AlreadyActive)
        ));

        let session = MockSession::new();
        let bad = "<create-subscription xmlns=\"x\"><stream>noSuch</stream></create-subscription>";
        match dispatch_send(&engine, &session, bad, &PassAll) {
            Err(DispatchError::Invalid(ValidationError::UnknownStream(name))) => {
                assert_eq!(name, "noSuch")
            }
            other => panic!("expected UnknownStream, got {other:?}"),
        }
        // The guard released the flag on the error path.
        assert!(!session.ntf_active().load(Ordering::Acquire));
    }

    #[test]
    fn test_receive_dispatcher_stops_on_notification_complete() {
        let session = MockSession::new();
        {
            let mut inbox = session.inbox.lock_or_panic();
            inbox.push_back(xml::envelope(
                "2023-11-14T22:13:20Z",
                "<netconf-session-start><username>alice</username>\
                 <session-id>42</session-id></netconf-session-start>",
            ));
            inbox.push_back("this is not xml".to_string());
            inbox.push_back(xml::envelope("2023-11-14T22:13:21Z", "<thing-happened/>"));
            inbox.push_back(xml::notification_complete("2023-11-14T22:13:22Z"));
            // Never consumed: the loop stopped at notificationComplete.
            inbox.push_back(xml::envelope("2023-11-14T22:13:23Z", "<after-end/>"));
        }

        let seen: Mutex<Vec<(u64, String)>> = Mutex::new(Vec::new());
        let callback = |time: u64, body: &str| {
            seen.lock_or_panic().push((time, body.to_string()));
        };
        dispatch_receive(&session, Some(&callback)).unwrap();

        let seen = seen.lock_or_panic();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1_700_000_000);
        assert!(seen[0].1.contains("<username>alice</username>"));
        assert!(seen[1].1.contains("thing-happened"));
        assert!(!session.ntf_active().load(Ordering::Acquire));
        assert_eq!(session.inbox.lock_or_panic().len(), 1);
    }

    #[test]
    fn test_receive_dispatcher_exits_when_session_stops_working() {
        let session = MockSession::new();
        session.working.store(false, Ordering::Release);
        dispatch_receive(&session, None).unwrap();
        assert!(!session.ntf_active().load(Ordering::Acquire));
    }

    #[test]
    fn test_received_accessors() {
        let frame = xml::envelope(
            "2023-11-14T22:13:20Z",
            "<netconf-confirmed-commit><confirm-event>start</confirm-event>\
             </netconf-confirmed-commit>",
        );
        let received = Received::decode(&frame).unwrap();
        assert_eq!(received.kind(), EventKind::ConfirmedCommit);
        assert_eq!(received.event_time(), 1_700_000_000);
        assert_eq!(received.event_time_iso(), "2023-11-14T22:13:20Z");
        assert!(received.content().starts_with("<netconf-confirmed-commit>"));
    }
}
