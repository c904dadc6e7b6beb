// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host-local fan-out of live notifications.
//!
//! Every subscriber binds one datagram socket under
//! `<streams>/.bus/<stream>/`; publishers enumerate that directory and send
//! one non-blocking datagram per subscriber. Signals keep the bus naming
//! contract (`libnetconf.notifications.stream`, the per-stream object path,
//! member `Event`) in the frame, so a broker-backed transport can replace
//! this one wire-for-wire.
//!
//! Delivery is best-effort: a full or vanished subscriber socket drops the
//! signal for that subscriber only, and a socket whose owner died is
//! unlinked by the next sender that trips over it.

use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use netconf_common::MutexExt;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::AsFd;
use tracing::{debug, warn};

use crate::error::{Result, StreamError};

/// Interface name carried by every signal.
pub const BUS_INTERFACE: &str = "libnetconf.notifications.stream";

/// Signal member carried by every signal.
pub const BUS_MEMBER: &str = "Event";

/// Largest accepted signal frame.
const MAX_SIGNAL_BYTES: usize = 64 * 1024;

const BUS_SUBDIR: &str = ".bus";
const DIR_MODE: u32 = 0o777;

static SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);

/// Object path of one stream's signals.
pub fn object_path(stream: &str) -> String {
    format!("/libnetconf/notifications/stream/{stream}")
}

/// One live signal as decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSignal {
    pub stream: String,
    pub event_time: u64,
    pub xml: String,
}

struct BusSub {
    stream: String,
    path: PathBuf,
    sock: UnixDatagram,
}

impl Drop for BusSub {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

struct BusInner {
    subs: Vec<BusSub>,
    sender: Option<UnixDatagram>,
    closed: bool,
}

/// One connection to the host-local notification bus.
pub struct Bus {
    root: PathBuf,
    inner: Mutex<BusInner>,
}

impl Bus {
    pub fn new(streams_dir: &Path) -> Bus {
        Bus {
            root: streams_dir.join(BUS_SUBDIR),
            inner: Mutex::new(BusInner {
                subs: Vec::new(),
                sender: None,
                closed: false,
            }),
        }
    }

    /// Registers interest in `stream`'s signals.
    pub fn subscribe(&self, stream: &str) -> Result<()> {
        let mut inner = self.inner.lock_or_panic();
        if inner.closed {
            return Err(StreamError::BusClosed);
        }
        if inner.subs.iter().any(|s| s.stream == stream) {
            return Ok(());
        }

        let dir = self.stream_dir(stream);
        fs::create_dir_all(&dir)?;
        let _ = fs::set_permissions(&dir, Permissions::from_mode(DIR_MODE));
        let _ = fs::set_permissions(&self.root, Permissions::from_mode(DIR_MODE));

        let path = dir.join(format!(
            "{}-{}.sock",
            std::process::id(),
            SOCKET_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let sock = UnixDatagram::bind(&path)?;
        sock.set_nonblocking(true)?;
        // Senders in other processes need write access to the socket inode.
        let _ = fs::set_permissions(&path, Permissions::from_mode(DIR_MODE));

        debug!(stream, sock = %path.display(), "subscribed to notification bus");
        inner.subs.push(BusSub {
            stream: stream.to_string(),
            path,
            sock,
        });
        Ok(())
    }

    /// Drops the registration for `stream`, if any.
    pub fn unsubscribe(&self, stream: &str) {
        let mut inner = self.inner.lock_or_panic();
        inner.subs.retain(|s| s.stream != stream);
    }

    /// Sends one signal to every current subscriber of `stream`, returning
    /// how many sockets accepted it. Non-blocking, best-effort.
    pub fn send(&self, stream: &str, event_time: u64, xml: &str) -> Result<usize> {
        let frame = encode_frame(stream, event_time, xml);
        if frame.len() > MAX_SIGNAL_BYTES {
            return Err(StreamError::Parse(format!(
                "signal of {} bytes exceeds the bus frame limit",
                frame.len()
            )));
        }

        let mut inner = self.inner.lock_or_panic();
        if inner.closed {
            return Err(StreamError::BusClosed);
        }
        if inner.sender.is_none() {
            let sock = UnixDatagram::unbound()?;
            sock.set_nonblocking(true)?;
            inner.sender = Some(sock);
        }
        #[allow(clippy::unwrap_used)]
        let sender = inner.sender.as_ref().unwrap();

        let dir = self.stream_dir(stream);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            // Nobody ever subscribed to this stream on this host.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut delivered = 0;
        for dirent in entries.flatten() {
            let path = dirent.path();
            if path.extension().map_or(true, |ext| ext != "sock") {
                continue;
            }
            match sender.send_to(&frame, &path) {
                Ok(_) => delivered += 1,
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    // The subscriber died without unlinking its socket.
                    debug!(sock = %path.display(), "removing stale bus socket");
                    let _ = fs::remove_file(&path);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Subscriber buffer full: the signal is lost for them.
                    debug!(sock = %path.display(), "bus subscriber is not keeping up");
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(sock = %path.display(), %err, "bus send failed");
                }
            }
        }
        Ok(delivered)
    }

    /// Waits up to `timeout` for the next signal on any subscribed stream.
    /// `Ok(None)` when the timeout elapses; `BusClosed` once closed.
    pub fn recv(&self, timeout: Duration) -> Result<Option<BusSignal>> {
        let inner = self.inner.lock_or_panic();
        if inner.closed {
            return Err(StreamError::BusClosed);
        }
        if inner.subs.is_empty() {
            drop(inner);
            std::thread::sleep(timeout);
            return Ok(None);
        }

        let ready: Vec<usize> = {
            let mut fds: Vec<PollFd> = inner
                .subs
                .iter()
                .map(|s| PollFd::new(s.sock.as_fd(), PollFlags::POLLIN))
                .collect();
            let millis = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                // Interrupted: the caller polls again on its next quantum.
                Err(nix::errno::Errno::EINTR) => return Ok(None),
                Err(errno) => return Err(StreamError::Io(io::Error::from(errno))),
            }
            fds.iter()
                .enumerate()
                .filter(|(_, fd)| {
                    fd.revents()
                        .unwrap_or(PollFlags::empty())
                        .contains(PollFlags::POLLIN)
                })
                .map(|(i, _)| i)
                .collect()
        };

        let mut buf = vec![0u8; MAX_SIGNAL_BYTES];
        for index in ready {
            let sub = &inner.subs[index];
            loop {
                match sub.sock.recv(&mut buf) {
                    Ok(len) => match decode_frame(&buf[..len]) {
                        Some(signal) if signal.stream == sub.stream => {
                            return Ok(Some(signal))
                        }
                        // Malformed or misdirected signals are skipped.
                        _ => continue,
                    },
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(None)
    }

    /// Terminal: unlinks every subscriber socket; all later calls observe
    /// `BusClosed`.
    pub fn close(&self) {
        let mut inner = self.inner.lock_or_panic();
        inner.closed = true;
        inner.subs.clear();
        inner.sender = None;
    }

    fn stream_dir(&self, stream: &str) -> PathBuf {
        self.root.join(stream)
    }
}

/// `iface_len | iface | path_len | path | member_len | member | time | xml`,
/// integers little-endian, lengths `u16`.
fn encode_frame(stream: &str, event_time: u64, xml: &str) -> Vec<u8> {
    let path = object_path(stream);
    let mut frame = Vec::with_capacity(
        BUS_INTERFACE.len() + path.len() + BUS_MEMBER.len() + xml.len() + 14,
    );
    for part in [BUS_INTERFACE, &path, BUS_MEMBER] {
        frame.extend_from_slice(&(part.len() as u16).to_le_bytes());
        frame.extend_from_slice(part.as_bytes());
    }
    frame.extend_from_slice(&event_time.to_le_bytes());
    frame.extend_from_slice(xml.as_bytes());
    frame
}

fn decode_frame(frame: &[u8]) -> Option<BusSignal> {
    fn take<'a>(rest: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
        if rest.len() < len {
            return None;
        }
        let (head, tail) = rest.split_at(len);
        *rest = tail;
        Some(head)
    }
    fn take_str(rest: &mut &[u8]) -> Option<String> {
        let len = take(rest, 2)?;
        let len = u16::from_le_bytes([len[0], len[1]]) as usize;
        String::from_utf8(take(rest, len)?.to_vec()).ok()
    }

    let mut rest = frame;
    let iface = take_str(&mut rest)?;
    let path = take_str(&mut rest)?;
    let member = take_str(&mut rest)?;
    if iface != BUS_INTERFACE || member != BUS_MEMBER {
        return None;
    }
    let stream = path.rsplit('/').next()?.to_string();
    if stream.is_empty() || !path.starts_with("/libnetconf/notifications/stream/") {
        return None;
    }

    let time_bytes = take(&mut rest, 8)?;
    let mut time = [0u8; 8];
    time.copy_from_slice(time_bytes);
    let event_time = u64::from_le_bytes(time);
    let xml = String::from_utf8(rest.to_vec()).ok()?;
    Some(BusSignal {
        stream,
        event_time,
        xml,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frame = encode_frame("netconf", 1_700_000_000, "<notification/>");
        let signal = decode_frame(&frame).unwrap();
        assert_eq!(
            signal,
            BusSignal {
                stream: "netconf".into(),
                event_time: 1_700_000_000,
                xml: "<notification/>".into(),
            }
        );
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let frame = encode_frame("netconf", 1, "<x/>");
        assert!(decode_frame(&frame[..5]).is_none());
        assert!(decode_frame(b"").is_none());
    }

    #[test]
    fn test_send_without_subscribers_is_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Bus::new(tmp.path());
        assert_eq!(bus.send("s", 1, "<x/>").unwrap(), 0);
    }

    #[test]
    fn test_pub_sub_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let rx = Bus::new(tmp.path());
        rx.subscribe("s").unwrap();

        let tx = Bus::new(tmp.path());
        assert_eq!(tx.send("s", 42, "<event/>").unwrap(), 1);

        let signal = rx.recv(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(signal.stream, "s");
        assert_eq!(signal.event_time, 42);
        assert_eq!(signal.xml, "<event/>");

        // Nothing else pending.
        assert!(rx.recv(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_signals_only_reach_matching_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let rx = Bus::new(tmp.path());
        rx.subscribe("a").unwrap();

        let tx = Bus::new(tmp.path());
        assert_eq!(tx.send("b", 1, "<x/>").unwrap(), 0);
        assert!(rx.recv(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_closed_bus_is_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Bus::new(tmp.path());
        bus.subscribe("s").unwrap();
        bus.close();
        assert!(matches!(
            bus.recv(Duration::from_millis(1)),
            Err(StreamError::BusClosed)
        ));
        assert!(matches!(
            bus.subscribe("s"),
            Err(StreamError::BusClosed)
        ));
    }

    #[test]
    fn test_unsubscribe_unlinks_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Bus::new(tmp.path());
        bus.subscribe("s").unwrap();
        let dir = tmp.path().join(BUS_SUBDIR).join("s");
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
        bus.unsubscribe("s");
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }
}
