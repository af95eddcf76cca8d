// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep and one-shot timers.
//!
//! Each armed timer owns a thread that races a deadline against a stop
//! channel. The `CancelToken` decides the race: the timer fires only if it
//! trips the token before `cancel` does.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::cancel::CancelToken;
use crate::channel::{self, RecvTimeoutError, Sender};

/// Block the current thread for the given duration.
pub fn sleep(duration: Duration) {
    thread::sleep(duration);
}

/// A one-shot timer. Dropping it cancels it.
#[derive(Debug)]
pub struct Timer {
    token: Arc<CancelToken>,
    stop: Sender<()>,
}

impl Timer {
    /// Run `f` once after `duration`, unless cancelled first.
    pub fn after<F>(duration: Duration, f: F) -> std::io::Result<Timer>
    where
        F: FnOnce() + Send + 'static,
    {
        let token = Arc::new(CancelToken::new());
        let (stop, stopped) = channel::unbounded::<()>();

        let fire_token = token.clone();
        thread::Builder::new()
            .name("tandem-timer".to_string())
            .spawn(move || match stopped.recv_timeout(duration) {
                Err(RecvTimeoutError::Timeout) => {
                    if fire_token.cancel() {
                        f();
                    }
                }
                // Stopped explicitly or the Timer was dropped.
                Ok(()) | Err(RecvTimeoutError::Closed) => {
                    trace!(?duration, "timer cancelled");
                }
            })?;

        Ok(Timer { token, stop })
    }

    /// Cancel the timer. Returns true if it was cancelled before firing.
    pub fn cancel(&self) -> bool {
        let won = self.token.cancel();
        let _ = self.stop.send(());
        won
    }

    /// Whether the timer has fired or been cancelled.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn sleep_short() {
        let start = Instant::now();
        sleep(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(9));
    }

    #[test]
    fn timer_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = Timer::after(Duration::from_millis(10), move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        sleep(Duration::from_millis(60));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(timer.is_done());
        // Too late to cancel.
        assert!(!timer.cancel());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = Timer::after(Duration::from_millis(30), move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(timer.cancel());
        sleep(Duration::from_millis(60));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_cancels() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        drop(
            Timer::after(Duration::from_millis(20), move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap(),
        );
        sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
