// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Validation of `<create-subscription>` requests.
//!
//! The validator is the one component that produces user-visible protocol
//! errors; everything it rejects maps onto the RFC 4741 error tags via
//! [`ValidationError::to_rpc_error`].

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::registry::BASE_STREAM;
use crate::xml;
use crate::NotificationEngine;

/// A validated subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub stream: String,
    pub start: Option<u64>,
    pub stop: Option<u64>,
    /// Raw `<filter>` element, handed opaquely to the filter evaluator.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("not a <create-subscription> request")]
    InvalidRpc,
    #[error("malformed subscription filter")]
    InvalidFilter,
    #[error("unknown stream {0}")]
    UnknownStream(String),
    #[error("stopTime requires startTime")]
    MissingStartTime,
    #[error("stopTime precedes startTime")]
    StopBeforeStart,
    #[error("startTime is in the future")]
    StartInFuture,
}

/// Protocol-level rendering of a validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    /// `invalid-value`, `bad-element`, `missing-element` or
    /// `operation-failed`.
    pub tag: &'static str,
    /// The offending element for `bad-element`/`missing-element`.
    pub element: Option<&'static str>,
    pub message: Option<String>,
}

impl ValidationError {
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            ValidationError::InvalidRpc => RpcError {
                tag: "operation-failed",
                element: None,
                message: Some("not a create-subscription request".into()),
            },
            ValidationError::InvalidFilter => RpcError {
                tag: "bad-element",
                element: Some("filter"),
                message: None,
            },
            ValidationError::UnknownStream(stream) => RpcError {
                tag: "invalid-value",
                element: None,
                message: Some(format!("Requested stream '{stream}' does not exist.")),
            },
            ValidationError::MissingStartTime => RpcError {
                tag: "missing-element",
                element: Some("startTime"),
                message: None,
            },
            ValidationError::StopBeforeStart => RpcError {
                tag: "bad-element",
                element: Some("stopTime"),
                message: None,
            },
            ValidationError::StartInFuture => RpcError {
                tag: "bad-element",
                element: Some("startTime"),
                message: None,
            },
        }
    }
}

#[derive(Debug, Default)]
struct Parsed {
    stream: Option<String>,
    start_raw: Option<String>,
    stop_raw: Option<String>,
    filter: Option<String>,
}

/// Checks `rpc` against the registry and the time-window rules.
///
/// `now` is the validator's idea of the current time (epoch seconds), passed
/// in so callers control the clock.
pub fn validate(
    rpc: &str,
    engine: &NotificationEngine,
    now: u64,
) -> Result<SubscriptionRequest, ValidationError> {
    let parsed = parse_request(rpc)?;

    let stream = parsed.stream.unwrap_or_else(|| BASE_STREAM.to_string());
    // Unparsable times make the request itself invalid.
    let start = match &parsed.start_raw {
        None => None,
        Some(raw) => Some(xml::iso_to_epoch(raw).ok_or(ValidationError::InvalidRpc)?),
    };
    let stop = match &parsed.stop_raw {
        None => None,
        Some(raw) => Some(xml::iso_to_epoch(raw).ok_or(ValidationError::InvalidRpc)?),
    };

    engine
        .registry()
        .with_inner(|inner| inner.get_or_probe(&stream))
        .map_err(|_| ValidationError::UnknownStream(stream.clone()))?;

    if stop.is_some() && start.is_none() {
        return Err(ValidationError::MissingStartTime);
    }
    if let (Some(start), Some(stop)) = (start, stop) {
        if start > stop {
            return Err(ValidationError::StopBeforeStart);
        }
    }
    if start.is_some_and(|s| s > now) {
        return Err(ValidationError::StartInFuture);
    }

    Ok(SubscriptionRequest {
        stream,
        start,
        stop,
        filter: parsed.filter,
    })
}

fn parse_request(rpc: &str) -> Result<Parsed, ValidationError> {
    let mut reader = Reader::from_str(rpc);
    // Mismatched end tags must fail parsing; the filter check depends on it.
    reader.config_mut().check_end_names = true;

    // Walk into the document (past any <rpc> wrapper) until the operation
    // element shows up.
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"create-subscription" => break,
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"create-subscription" => {
                // All defaults.
                return Ok(Parsed::default());
            }
            Ok(Event::Start(_)) => continue,
            Ok(Event::Eof) => return Err(ValidationError::InvalidRpc),
            Ok(_) => continue,
            Err(_) => return Err(ValidationError::InvalidRpc),
        }
    }

    let mut parsed = Parsed::default();
    loop {
        let before = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"stream" => {
                    parsed.stream = Some(read_trimmed_text(&mut reader, &e)?);
                }
                b"startTime" => {
                    parsed.start_raw = Some(read_trimmed_text(&mut reader, &e)?);
                }
                b"stopTime" => {
                    parsed.stop_raw = Some(read_trimmed_text(&mut reader, &e)?);
                }
                b"filter" => match reader.read_to_end(e.name()) {
                    Ok(_) => {
                        let after = reader.buffer_position() as usize;
                        parsed.filter = Some(rpc[before..after].to_string());
                    }
                    Err(_) => return Err(ValidationError::InvalidFilter),
                },
                _ => {
                    reader
                        .read_to_end(e.name())
                        .map_err(|_| ValidationError::InvalidRpc)?;
                }
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"filter" => {
                let after = reader.buffer_position() as usize;
                parsed.filter = Some(rpc[before..after].to_string());
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"create-subscription" => break,
            Ok(Event::Eof) => return Err(ValidationError::InvalidRpc),
            Ok(_) => continue,
            Err(_) => return Err(ValidationError::InvalidRpc),
        }
    }
    Ok(parsed)
}

fn read_trimmed_text(
    reader: &mut Reader<&[u8]>,
    start: &quick_xml::events::BytesStart,
) -> Result<String, ValidationError> {
    reader
        .read_text(start.name())
        .map(|text| text.trim().to_string())
        .map_err(|_| ValidationError::InvalidRpc)
}
