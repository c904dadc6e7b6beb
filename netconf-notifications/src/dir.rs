// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolution of the on-disk directory holding the per-stream files.
//!
//! Every server process on the host publishes into the same directory, so it
//! is created world-writable; trust between publishers is filesystem
//! permission based.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use netconf_common::config::parse_env;

use crate::error::{Result, StreamError};

/// Environment override for the streams directory.
pub const STREAMS_PATH_ENV: &str = "LIBNETCONF_STREAMS";

/// Compiled-in default when the environment does not override it.
pub const DEFAULT_STREAMS_DIR: &str = "/var/run/libnetconf/streams";

const DIR_MODE: u32 = 0o777;

/// Resolves the streams directory, creating it on first use.
///
/// Fails when the resolved path exists but is not a directory, or is not
/// accessible for read+write+search.
pub fn streams_dir() -> Result<PathBuf> {
    let path = parse_env::str_not_empty(STREAMS_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STREAMS_DIR));
    ensure_dir(&path)?;
    Ok(path)
}

/// Same checks as [`streams_dir`] for an explicitly chosen directory.
pub fn ensure_dir(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(md) if md.is_dir() => {}
        Ok(_) => {
            return Err(StreamError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exists and is not a directory", path.display()),
            )))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path)?;
            // mkdir is subject to the umask; force the world-writable mode so
            // any server process on the host can publish.
            fs::set_permissions(path, fs::Permissions::from_mode(DIR_MODE))?;
        }
        Err(err) => return Err(err.into()),
    }

    let flags = nix::unistd::AccessFlags::R_OK
        | nix::unistd::AccessFlags::W_OK
        | nix::unistd::AccessFlags::X_OK;
    nix::unistd::access(path, flags)
        .map_err(|errno| StreamError::Io(io::Error::from(errno)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_missing_directory_world_writable() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("streams");
        ensure_dir(&target).unwrap();

        let md = fs::metadata(&target).unwrap();
        assert!(md.is_dir());
        assert_eq!(md.permissions().mode() & 0o777, 0o777);

        // Idempotent on an existing directory.
        ensure_dir(&target).unwrap();
    }

    #[test]
    fn test_rejects_non_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("streams");
        fs::write(&target, b"plain file").unwrap();
        assert!(ensure_dir(&target).is_err());
    }

    #[test]
    fn test_env_override_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("override");
        std::env::set_var(STREAMS_PATH_ENV, &target);
        let resolved = streams_dir().unwrap();
        std::env::remove_var(STREAMS_PATH_ENV);
        assert_eq!(resolved, target);
        assert!(target.is_dir());
    }
}
