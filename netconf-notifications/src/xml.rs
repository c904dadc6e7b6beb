// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The RFC 5277 notification envelope: construction, decomposition, and the
//! ISO-8601 event times it carries.

use chrono::{DateTime, SecondsFormat};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Result, StreamError};

/// Namespace of the notification envelope.
pub const NOTIFICATION_NS: &str = "urn:ietf:params:xml:ns:netconf:notification:1.0";

/// Namespace of the stream-status document.
pub const NETMOD_NS: &str = "urn:ietf:params:xml:ns:netmod:notification";

/// Wraps a body in `<notification><eventTime/>…</notification>`.
pub fn envelope(event_time_iso: &str, body: &str) -> String {
    format!(
        "<notification xmlns=\"{NOTIFICATION_NS}\">\
         <eventTime>{event_time_iso}</eventTime>{body}</notification>"
    )
}

/// The synthesized end-of-replay notification.
pub fn replay_complete(event_time_iso: &str) -> String {
    envelope(event_time_iso, "<replayComplete/>")
}

/// The synthesized end-of-subscription notification.
pub fn notification_complete(event_time_iso: &str) -> String {
    envelope(event_time_iso, "<notificationComplete/>")
}

/// A decomposed notification envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub event_time_iso: String,
    /// Epoch seconds parsed from `eventTime`; `None` when unparsable.
    pub event_time: Option<u64>,
    /// Raw XML of each body child, `eventTime` excluded, document order.
    pub children: Vec<String>,
    /// Local name of the first body child; the event name of the record.
    pub event_name: Option<String>,
}

/// Splits an envelope into event time and raw body children.
pub fn parse_envelope(xml: &str) -> Result<Envelope> {
    let mut reader = Reader::from_str(xml);
    let mut event_time_iso = None;
    let mut children = Vec::new();
    let mut event_name = None;
    let mut in_notification = false;

    loop {
        let before = reader.buffer_position() as usize;
        match reader.read_event()? {
            Event::Start(start) if !in_notification => {
                if start.local_name().as_ref() != b"notification" {
                    return Err(StreamError::Parse(
                        "root element is not <notification>".into(),
                    ));
                }
                in_notification = true;
            }
            Event::Start(start) => {
                let local = start.local_name().as_ref().to_vec();
                if local == b"eventTime" && event_time_iso.is_none() {
                    let text = reader.read_text(start.name())?;
                    event_time_iso = Some(text.trim().to_string());
                } else {
                    if event_name.is_none() {
                        event_name = Some(String::from_utf8_lossy(&local).into_owned());
                    }
                    reader.read_to_end(start.name())?;
                    let after = reader.buffer_position() as usize;
                    children.push(xml[before..after].to_string());
                }
            }
            Event::Empty(empty) if in_notification => {
                let local = empty.local_name().as_ref().to_vec();
                if event_name.is_none() {
                    event_name = Some(String::from_utf8_lossy(&local).into_owned());
                }
                let after = reader.buffer_position() as usize;
                children.push(xml[before..after].to_string());
            }
            Event::End(end) if end.local_name().as_ref() == b"notification" => break,
            Event::Eof => {
                if !in_notification {
                    return Err(StreamError::Parse("empty notification document".into()));
                }
                break;
            }
            _ => {}
        }
    }

    let event_time_iso =
        event_time_iso.ok_or_else(|| StreamError::Parse("notification without eventTime".into()))?;
    let event_time = iso_to_epoch(&event_time_iso);
    Ok(Envelope {
        event_time_iso,
        event_time,
        children,
        event_name,
    })
}

/// Local name of the first element of an XML fragment.
pub fn first_element_name(fragment: &str) -> Result<String> {
    let mut reader = Reader::from_str(fragment);
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                return Ok(String::from_utf8_lossy(e.local_name().as_ref()).into_owned())
            }
            Event::Empty(e) => {
                return Ok(String::from_utf8_lossy(e.local_name().as_ref()).into_owned())
            }
            Event::Eof => {
                return Err(StreamError::Parse("fragment contains no element".into()))
            }
            _ => {}
        }
    }
}

/// Whether the fragment parses as well-formed XML content.
pub fn is_well_formed(fragment: &str) -> bool {
    let mut reader = Reader::from_str(fragment);
    reader.config_mut().check_end_names = true;
    loop {
        match reader.read_event() {
            Ok(Event::Eof) => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}

/// Minimal text escaping for element content.
pub fn escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

/// Epoch seconds → RFC 3339 / ISO 8601, UTC.
pub fn epoch_to_iso(secs: u64) -> String {
    match DateTime::from_timestamp(secs as i64, 0) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => String::from("1970-01-01T00:00:00Z"),
    }
}

/// RFC 3339 / ISO 8601 → epoch seconds; `None` when unparsable or pre-epoch.
pub fn iso_to_epoch(s: &str) -> Option<u64> {
    let dt = DateTime::parse_from_rfc3339(s).ok()?;
    u64::try_from(dt.timestamp()).ok()
}
