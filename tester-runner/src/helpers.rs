// Copyright (c) The rtems-tester Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// All state shared between test threads is made of counters and buffers which remain consistent
/// across a panic, so poisoning carries no information here.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the system's description of an error number, like `strerror(3)`.
pub(crate) fn strerror(code: i32) -> String {
    #[cfg(unix)]
    {
        nix::errno::Errno::from_raw(code).desc().to_owned()
    }
    #[cfg(not(unix))]
    {
        let message = std::io::Error::from_raw_os_error(code).to_string();
        // Strip the " (os error N)" suffix std adds.
        match message.rfind(" (os error ") {
            Some(idx) => message[..idx].to_owned(),
            None => message,
        }
    }
}

/// Formats a count with a singular or plural noun.
pub(crate) fn plural(count: usize, singular: &'static str, plural: &'static str) -> String {
    if count == 1 {
        format!("{count} {singular}")
    } else {
        format!("{count} {plural}")
    }
}
