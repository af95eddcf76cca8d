// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspendable computations.
//!
//! A `Coroutine` runs its body on a dedicated OS thread but never in
//! parallel with its host: `start`/`resume` hand control over through a
//! rendezvous channel and block until the body suspends or finishes.
//! The body starts suspended.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use tracing::trace;

use crate::channel::{self, Receiver, Sender};

/// What the host observes after handing control to the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resumed<Y> {
    /// The body suspended, handing out a value.
    Yielded(Y),
    /// The body returned. Resuming again is a no-op that reports `Complete`.
    Complete,
    /// The body panicked with the given message.
    Panicked(String),
}

/// Coroutine lifecycle as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    /// Spawned, body not entered yet.
    Created,
    /// Parked inside `Suspender::suspend`.
    Suspended,
    /// Returned, panicked, or lost its thread.
    Finished,
}

enum Input<R> {
    Start,
    Resume(R),
}

enum Output<Y> {
    Yield(Y),
    Done(Result<(), String>),
}

/// Unwind payload for a body whose host dropped the coroutine.
struct Abandoned;

fn abandon() -> ! {
    panic::resume_unwind(Box::new(Abandoned))
}

/// The body's side of the handoff.
pub struct Suspender<Y, R> {
    to_host: Sender<Output<Y>>,
    from_host: Receiver<Input<R>>,
}

impl<Y, R> Suspender<Y, R> {
    /// Hand `value` to the host and park until resumed.
    ///
    /// If the host drops the coroutine meanwhile, the body unwinds silently
    /// from this call so its destructors still run.
    pub fn suspend(&self, value: Y) -> R {
        if self.to_host.send(Output::Yield(value)).is_err() {
            abandon();
        }
        match self.from_host.recv() {
            Ok(Input::Resume(value)) => value,
            Ok(Input::Start) => panic!("coroutine started twice"),
            Err(_) => abandon(),
        }
    }
}

impl<Y, R> std::fmt::Debug for Suspender<Y, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Suspender").finish_non_exhaustive()
    }
}

/// Host handle to a suspendable computation.
pub struct Coroutine<Y, R> {
    name: String,
    to_co: Sender<Input<R>>,
    from_co: Receiver<Output<Y>>,
    state: CoroutineState,
    thread: Option<JoinHandle<()>>,
}

impl<Y, R> Coroutine<Y, R>
where
    Y: Send + 'static,
    R: Send + 'static,
{
    /// Create a suspended computation. Nothing in `body` runs until `start`.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(Suspender<Y, R>) + Send + 'static,
    {
        let name = name.into();
        let (to_co, from_host) = channel::unbuffered::<Input<R>>();
        let (to_host, from_co) = channel::unbuffered::<Output<Y>>();

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            match from_host.recv() {
                Ok(Input::Start) => {}
                // Dropped before it was ever started.
                Ok(Input::Resume(_)) | Err(_) => return,
            }

            let done_tx = to_host.clone();
            let suspender = Suspender { to_host, from_host };
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || body(suspender)));
            let done = match outcome {
                Ok(()) => Ok(()),
                Err(payload) if payload.is::<Abandoned>() => {
                    trace!("coroutine abandoned by its host");
                    return;
                }
                Err(payload) => Err(panic_message(payload.as_ref())),
            };
            let _ = done_tx.send(Output::Done(done));
        })?;

        Ok(Self {
            name,
            to_co,
            from_co,
            state: CoroutineState::Created,
            thread: Some(thread),
        })
    }

    /// Enter the body for the first time.
    ///
    /// Calling `start` on a coroutine that already started behaves like
    /// resuming a finished one.
    pub fn start(&mut self) -> Resumed<Y> {
        if self.state != CoroutineState::Created {
            return self.finished_or_misuse("start");
        }
        self.transfer(Input::Start)
    }

    /// Resume a suspended body with `value`.
    pub fn resume(&mut self, value: R) -> Resumed<Y> {
        match self.state {
            CoroutineState::Suspended => self.transfer(Input::Resume(value)),
            CoroutineState::Created => {
                panic!("coroutine `{}` resumed before start", self.name)
            }
            CoroutineState::Finished => Resumed::Complete,
        }
    }

    pub fn state(&self) -> CoroutineState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == CoroutineState::Finished
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn finished_or_misuse(&self, op: &str) -> Resumed<Y> {
        match self.state {
            CoroutineState::Finished => Resumed::Complete,
            _ => panic!("coroutine `{}`: {} while suspended", self.name, op),
        }
    }

    fn transfer(&mut self, input: Input<R>) -> Resumed<Y> {
        if self.to_co.send(input).is_err() {
            self.finish();
            return Resumed::Panicked(format!("coroutine `{}` lost its thread", self.name));
        }

        match self.from_co.recv() {
            Ok(Output::Yield(value)) => {
                self.state = CoroutineState::Suspended;
                Resumed::Yielded(value)
            }
            Ok(Output::Done(Ok(()))) => {
                self.finish();
                Resumed::Complete
            }
            Ok(Output::Done(Err(msg))) => {
                self.finish();
                Resumed::Panicked(msg)
            }
            Err(_) => {
                self.finish();
                Resumed::Panicked(format!(
                    "coroutine `{}` exited without a result",
                    self.name
                ))
            }
        }
    }

    fn finish(&mut self) {
        self.state = CoroutineState::Finished;
        if let Some(thread) = self.thread.take() {
            // The body already reported; this only reaps the thread.
            let _ = thread.join();
        }
    }
}

impl<Y, R> std::fmt::Debug for Coroutine<Y, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn starts_suspended() {
        let entered = Arc::new(AtomicBool::new(false));
        let e = entered.clone();
        let mut co = Coroutine::<(), ()>::spawn("idle", move |_s| {
            e.store(true, Ordering::SeqCst);
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(!entered.load(Ordering::SeqCst));
        assert_eq!(co.state(), CoroutineState::Created);
        assert_eq!(co.start(), Resumed::Complete);
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn yield_and_resume_pass_values() {
        let mut co = Coroutine::<i32, i32>::spawn("echo", |s| {
            let mut acc = 0;
            for i in 1..=3 {
                acc += s.suspend(i);
            }
            assert_eq!(acc, 60);
        })
        .unwrap();

        assert_eq!(co.start(), Resumed::Yielded(1));
        assert_eq!(co.resume(10), Resumed::Yielded(2));
        assert_eq!(co.resume(20), Resumed::Yielded(3));
        assert_eq!(co.resume(30), Resumed::Complete);
        assert!(co.is_finished());
        // A finished coroutine is never re-entered.
        assert_eq!(co.resume(40), Resumed::Complete);
    }

    #[test]
    fn panic_is_reported() {
        let mut co = Coroutine::<(), ()>::spawn("boom", |_s| panic!("boom")).unwrap();
        match co.start() {
            Resumed::Panicked(msg) => assert!(msg.contains("boom")),
            other => panic!("expected Panicked, got {:?}", other),
        }
        assert!(co.is_finished());
    }

    #[test]
    fn dropping_suspended_coroutine_unwinds_body() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let d = dropped.clone();
        let mut co = Coroutine::<(), ()>::spawn("abandoned", move |s| {
            let _flag = Flag(d);
            s.suspend(());
            unreachable!("host went away");
        })
        .unwrap();
        assert_eq!(co.start(), Resumed::Yielded(()));
        drop(co);

        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("body was not unwound");
    }
}
