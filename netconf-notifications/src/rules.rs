// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-stream allowlist of event names, shared between processes as a
//! fixed-size memory-mapped file of newline-delimited names.

use std::fs::{File, OpenOptions, Permissions};
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::ptr::NonNull;
use std::slice;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::{Result, StreamError};

/// Size of the mapped region and therefore of every `.rules` file.
pub const RULES_BYTES: usize = 1024 * 1024;

const FILE_MODE: u32 = 0o777;

/// Shared mutable mapping of one stream's `.rules` file.
///
/// Appends are serialized by the registry lock (and `&mut self`); lookups are
/// lock-free point-in-time scans. A reader racing an appender may or may not
/// see the new name, which is acceptable for best-effort routing.
pub struct RuleTable {
    stream: String,
    map: NonNull<libc::c_void>,
    _file: File,
}

// SAFETY: the mapping is plain bytes; interior mutation only happens through
// `&mut self` within this process, and cross-process visibility has the same
// guarantees the underlying shared file mapping gives everyone else.
unsafe impl Send for RuleTable {}
unsafe impl Sync for RuleTable {}

impl RuleTable {
    /// Opens (creating and sparsely growing if needed) `<stream>.rules` in
    /// `dir` and maps it read+write shared.
    pub fn open(dir: &Path, stream: &str) -> Result<Self> {
        let path = dir.join(format!("{stream}.rules"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(FILE_MODE)
            .open(&path)?;
        if file.metadata()?.len() < RULES_BYTES as u64 {
            file.set_len(RULES_BYTES as u64)?;
            // open(2) applied the umask; any publisher must be able to write.
            let _ = file.set_permissions(Permissions::from_mode(FILE_MODE));
        }

        #[allow(clippy::unwrap_used)]
        let len = NonZeroUsize::new(RULES_BYTES).unwrap();
        let map = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(|errno| StreamError::Map(io::Error::from(errno)))?;

        Ok(RuleTable {
            stream: stream.to_string(),
            map,
            _file: file,
        })
    }

    /// Whether `event` is allowed on this stream: some line equals it exactly.
    pub fn contains(&self, event: &str) -> bool {
        let mem = self.as_bytes();
        let mut start = 0;
        while start < RULES_BYTES && mem[start] != 0 {
            let Some(nl) = mem[start..].iter().position(|&b| b == b'\n') else {
                return false;
            };
            if &mem[start..start + nl] == event.as_bytes() {
                return true;
            }
            start += nl + 1;
        }
        false
    }

    /// Appends `event` after the last newline. Idempotent; a name that no
    /// longer fits in the region is a [`StreamError::RuleCapacity`] error.
    pub fn allow(&mut self, event: &str) -> Result<()> {
        if event.is_empty() || event.contains(['\n', '\0']) {
            return Err(StreamError::Parse(format!(
                "invalid event name {event:?}"
            )));
        }
        if self.contains(event) {
            return Ok(());
        }

        let offset = self.append_offset();
        let needed = event.len() + 1;
        if offset + needed > RULES_BYTES {
            return Err(StreamError::RuleCapacity(self.stream.clone()));
        }

        let mem = self.as_bytes_mut();
        mem[offset..offset + event.len()].copy_from_slice(event.as_bytes());
        mem[offset + event.len()] = b'\n';
        Ok(())
    }

    /// First zero byte after the last newline, i.e. where the next name goes.
    fn append_offset(&self) -> usize {
        let mem = self.as_bytes();
        let mut start = 0;
        while start < RULES_BYTES && mem[start] != 0 {
            match mem[start..].iter().position(|&b| b == b'\n') {
                Some(nl) => start += nl + 1,
                // A line that was never terminated: treat the region as full.
                None => return RULES_BYTES,
            }
        }
        start
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map.as_ptr() as *const u8, RULES_BYTES) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.map.as_ptr() as *mut u8, RULES_BYTES) }
    }
}

impl Drop for RuleTable {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.map, RULES_BYTES);
        }
    }
}

impl std::fmt::Debug for RuleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleTable")
            .field("stream", &self.stream)
            .field("used", &self.append_offset())
            .finish()
    }
}
