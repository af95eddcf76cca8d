// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels.
//!
//! Two shapes over `std::sync::mpsc`: a rendezvous channel for handing
//! control between a coroutine and its host, and an unbounded queue for
//! wake-ups that must never block the party sending them.

use std::fmt;
use std::sync::mpsc;
use std::time::Duration;

/// The receiving side is gone. The value comes back to the sender.
#[derive(Debug)]
pub struct SendError<T>(pub T);

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sending on a closed channel")
    }
}

/// Every sender is gone and nothing is buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvError;

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "receiving on a closed channel")
    }
}

impl std::error::Error for RecvError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    /// Nothing arrived before the deadline.
    Timeout,
    /// Every sender is gone.
    Closed,
}

/// Create a rendezvous channel. `send` returns only once the receiver has
/// taken the value.
pub fn unbuffered<T>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::sync_channel(0);
    (
        Sender {
            inner: Outlet::Rendezvous(tx),
        },
        Receiver { inner: rx },
    )
}

/// Create an unbounded channel. `send` never blocks.
pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::channel();
    (
        Sender {
            inner: Outlet::Queue(tx),
        },
        Receiver { inner: rx },
    )
}

enum Outlet<T> {
    Rendezvous(mpsc::SyncSender<T>),
    Queue(mpsc::Sender<T>),
}

pub struct Sender<T> {
    inner: Outlet<T>,
}

impl<T> Sender<T> {
    pub fn send(&self, val: T) -> Result<(), SendError<T>> {
        match &self.inner {
            Outlet::Rendezvous(tx) => tx.send(val).map_err(|e| SendError(e.0)),
            Outlet::Queue(tx) => tx.send(val).map_err(|e| SendError(e.0)),
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            Outlet::Rendezvous(tx) => Outlet::Rendezvous(tx.clone()),
            Outlet::Queue(tx) => Outlet::Queue(tx.clone()),
        };
        Sender { inner }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner {
            Outlet::Rendezvous(_) => "rendezvous",
            Outlet::Queue(_) => "queue",
        };
        f.debug_struct("Sender").field("kind", &kind).finish()
    }
}

pub struct Receiver<T> {
    inner: mpsc::Receiver<T>,
}

impl<T> Receiver<T> {
    /// Block until a value arrives or every sender is dropped.
    pub fn recv(&self) -> Result<T, RecvError> {
        self.inner.recv().map_err(|_| RecvError)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.inner.recv_timeout(timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => RecvTimeoutError::Timeout,
            mpsc::RecvTimeoutError::Disconnected => RecvTimeoutError::Closed,
        })
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn rendezvous_send_waits_for_receiver() {
        let (tx, rx) = unbuffered();
        let (done_tx, done_rx) = unbounded();
        thread::spawn(move || {
            tx.send(99).unwrap();
            done_tx.send(()).unwrap();
        });
        thread::sleep(Duration::from_millis(10));
        assert_eq!(rx.recv().unwrap(), 99);
        done_rx.recv().unwrap();
    }

    #[test]
    fn queue_never_blocks_the_sender() {
        let (tx, rx) = unbounded();
        for i in 0..1000 {
            tx.send(i).unwrap();
        }
        assert_eq!(rx.recv().unwrap(), 0);
    }

    #[test]
    fn dropped_senders_close_the_channel() {
        let (tx, rx) = unbounded::<i32>();
        let tx2 = tx.clone();
        drop(tx);
        drop(tx2);
        assert_eq!(rx.recv(), Err(RecvError));
    }

    #[test]
    fn dropped_receiver_returns_the_value() {
        let (tx, rx) = unbuffered::<&str>();
        drop(rx);
        match tx.send("lost") {
            Err(SendError(v)) => assert_eq!(v, "lost"),
            Ok(()) => panic!("send on a closed channel succeeded"),
        }
    }

    #[test]
    fn recv_timeout_tells_deadline_from_close() {
        let (tx, rx) = unbounded::<i32>();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(5)),
            Err(RecvTimeoutError::Timeout)
        );
        drop(tx);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(5)),
            Err(RecvTimeoutError::Closed)
        );
    }

    #[test]
    fn multiple_producers() {
        let (tx, rx) = unbounded();
        let tx2 = tx.clone();
        thread::spawn(move || tx.send(1).unwrap());
        thread::spawn(move || tx2.send(2).unwrap());
        let mut vals = vec![rx.recv().unwrap(), rx.recv().unwrap()];
        vals.sort();
        assert_eq!(vals, vec![1, 2]);
    }
}
