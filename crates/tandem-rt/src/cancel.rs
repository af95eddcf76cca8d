// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation.
//!
//! AtomicBool flag shared between the owner of a timer and the thread
//! that would fire it. Whoever trips the flag first wins.

use std::sync::atomic::{AtomicBool, Ordering};

/// Cancellation token shared between two parties.
#[derive(Debug)]
pub struct CancelToken {
    flag: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Set the cancellation flag. Returns true if this call set it, false
    /// if it was already set.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::AcqRel)
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
