// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod config;
#[cfg(unix)]
pub mod locks;

use std::sync::{Mutex, MutexGuard};

/// The "shipping" way of unwrapping a poisoned mutex: a poisoned lock means a
/// writer panicked while holding it, and continuing with the shared state is
/// not safe either way.
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}
