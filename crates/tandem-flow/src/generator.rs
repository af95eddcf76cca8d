// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Pull-driven generators.
//!
//! Each pull resumes the body until its next `yield_value` or until it
//! returns. Pulled from inside another flow's body, the pull is registered
//! on that flow as a fire-and-forget task so the outer flow suspends like
//! it would for any other operation.

use std::panic::Location;
use std::thread;

use serde_json::Value;
use tandem_rt::coroutine::panic_message;
use tracing::trace;

use crate::block::{self, finish_step, Driver, Slot, Step};
use crate::coordinator::Flow;
use crate::error::{FlowError, Result};
use crate::task::TaskOptions;

pub struct Generator {
    driver: Driver,
    slot: Slot<()>,
    done: bool,
    current: Option<Value>,
}

impl Generator {
    pub(crate) fn new(driver: Driver, slot: Slot<()>) -> Self {
        Self {
            driver,
            slot,
            done: false,
            current: None,
        }
    }

    /// Advance to the next value. Returns false once the body has returned;
    /// from then on it stays false and the body is never run again.
    ///
    /// An error returned by the body is reported by the pull that observes
    /// the end.
    #[track_caller]
    pub fn move_next(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }

        let (step, waited) = match block::current() {
            Some(outer) => self.pull_within(&outer, Location::caller())?,
            None => (self.driver.advance(), Ok(())),
        };

        let advanced = match finish_step(&self.driver, &self.slot, step) {
            Ok(Some(value)) => {
                self.current = Some(value);
                Ok(true)
            }
            Ok(None) => {
                self.finish();
                Ok(false)
            }
            Err(err) => {
                self.finish();
                Err(err)
            }
        };
        waited.and(advanced)
    }

    /// Resume the body on a helper thread while `outer` waits for it.
    fn pull_within(
        &mut self,
        outer: &Flow,
        site: &'static Location<'static>,
    ) -> Result<(Step, Result<()>)> {
        let completion = outer.admit_task(TaskOptions::new().dont_wait(), true, site)?;
        let key = completion.key().to_string();
        trace!(flow = outer.id(), key = %key, "pulling generator");

        let driver = &mut self.driver;
        let (step, waited) = thread::scope(|scope| {
            let puller = scope.spawn(move || {
                let step = driver.advance();
                let _ = completion.succeed(Vec::new());
                step
            });
            let waited = outer.wait_key(&key, false, site).map(|_| ());
            let step = puller
                .join()
                .unwrap_or_else(|payload| Step::Panicked(panic_message(payload.as_ref())));
            (step, waited)
        });

        // The wait may have bailed out on another task's error.
        outer.forget(&key);
        Ok((step, waited))
    }

    fn finish(&mut self) {
        self.done = true;
        self.current = None;
    }

    /// The value produced by the last successful pull.
    pub fn current(&self) -> Option<&Value> {
        self.current.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Pull and return the next value, failing with `Exhausted` at the end.
    #[track_caller]
    pub fn next_value(&mut self) -> Result<Value> {
        if self.move_next()? {
            Ok(self.current.clone().unwrap_or(Value::Null))
        } else {
            Err(FlowError::Exhausted)
        }
    }
}

impl Iterator for Generator {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.move_next() {
            Ok(true) => self.current.clone().map(Ok),
            Ok(false) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("flow", &self.driver.shared().id)
            .field("done", &self.done)
            .finish()
    }
}
