// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io;
use std::os::unix::prelude::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::FcntlArg;

/// Exclusive whole-file advisory lock, shared between processes.
///
/// The lock is taken with `fcntl(F_SETLKW)` on a file the caller already has
/// open, so it serializes every cooperating reader and writer of that file on
/// the host. Dropping the guard releases the lock; releasing also happens
/// implicitly if the process dies while holding it.
///
/// fcntl locks are per-process: a second acquisition from the same process
/// succeeds immediately, so this must not be used as an intra-process mutex.
#[must_use]
pub struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    /// Blocks until the whole-file write lock is granted.
    pub fn exclusive(file: &'a File) -> io::Result<Self> {
        let lock = whole_file(libc::F_WRLCK);
        set_lock_retry(file.as_raw_fd(), &lock)?;
        Ok(FileLock { file })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        let lock = whole_file(libc::F_UNLCK);
        let _ = nix::fcntl::fcntl(self.file.as_raw_fd(), FcntlArg::F_SETLK(&lock));
    }
}

fn whole_file(l_type: libc::c_int) -> libc::flock {
    libc::flock {
        l_type: l_type as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    }
}

fn set_lock_retry(fd: RawFd, lock: &libc::flock) -> io::Result<()> {
    loop {
        match nix::fcntl::fcntl(fd, FcntlArg::F_SETLKW(lock)) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}
