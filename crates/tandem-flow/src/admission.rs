// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task registration, admission control and the pending queue.

use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use tandem_rt::Timer;
use tracing::trace;

use crate::coordinator::{claim_wake, Flow, FlowHandle, Wake};
use crate::error::{FlowError, Result};
use crate::event::FlowEvent;
use crate::registry::{FlowState, PendingTask};
use crate::task::{Completion, TaskCell, TaskOptions};

impl Flow {
    /// Register a task and get the handle that completes it.
    ///
    /// At the concurrency cap this suspends until a running task finishes,
    /// so a failure observed meanwhile is returned here.
    #[track_caller]
    pub fn register(&self, options: TaskOptions) -> Result<Completion> {
        self.admit_task(options, false, Location::caller())
    }

    /// Register an unkeyed task.
    #[track_caller]
    pub fn add(&self) -> Result<Completion> {
        self.register(TaskOptions::new())
    }

    #[track_caller]
    pub fn add_keyed(&self, key: impl Into<String>) -> Result<Completion> {
        self.register(TaskOptions::keyed(key))
    }

    /// Register a task whose values are returned as an object keyed by
    /// `shape`.
    #[track_caller]
    pub fn add_formatted<I, S>(&self, key: Option<&str>, shape: I) -> Result<Completion>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut options = TaskOptions::new().response_format(shape);
        if let Some(key) = key {
            options = options.key(key);
        }
        self.register(options)
    }

    #[track_caller]
    pub fn register_ignoring_error(&self, options: TaskOptions) -> Result<Completion> {
        self.register(options.ignore_error())
    }

    /// Register a keyed fire-and-forget task, read later with `get` or
    /// `wait_for`.
    #[track_caller]
    pub fn set(&self, key: impl Into<String>) -> Result<Completion> {
        self.set_with(TaskOptions::keyed(key))
    }

    #[track_caller]
    pub fn set_with(&self, options: TaskOptions) -> Result<Completion> {
        if options.key.is_none() {
            return Err(FlowError::MissingKey);
        }
        self.register(options.dont_wait())
    }

    /// Queue an operation. It is admitted, and `executor` called with its
    /// completion, at the next wait.
    pub fn enqueue<F>(&self, options: TaskOptions, executor: F)
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.shared().lock().queue.push_back(PendingTask {
            options,
            executor: Box::new(executor),
        });
    }

    pub fn enqueue_ignoring_error<F>(&self, options: TaskOptions, executor: F)
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.enqueue(options.ignore_error(), executor);
    }

    pub(crate) fn admit_task(
        &self,
        options: TaskOptions,
        force_auto: bool,
        site: &'static Location<'static>,
    ) -> Result<Completion> {
        let shared = self.shared();
        let (key, hidden) = shared.lock().assign_key(options.key.clone(), force_auto);

        while self.park_if(site, FlowState::at_capacity)? {}

        let (cell, timeout) = shared.lock().admit(key, hidden, &options);
        trace!(flow = shared.id, key = %cell.key, ?timeout, "task registered");

        if let Some(timeout) = timeout {
            self.arm(&cell, timeout)?;
        }
        Ok(Completion::new(cell, shared.clone()))
    }

    fn arm(&self, cell: &Arc<TaskCell>, timeout: Duration) -> Result<()> {
        let target = cell.clone();
        let flow = Arc::downgrade(self.shared());
        let timer = Timer::after(timeout, move || {
            if let Some(flow) = flow.upgrade() {
                target.expire(&flow);
            }
        })
        .map_err(|e| FlowError::Spawn(e.to_string()))?;

        cell.arm(timer);
        // Settled before the timer was stored: nothing left to time out.
        if !cell.is_pending() {
            cell.cancel_timer();
        }
        Ok(())
    }

    /// Admit everything queued, in order.
    pub(crate) fn drain(&self, site: &'static Location<'static>) -> Result<()> {
        loop {
            let next = self.shared().lock().next_pending();
            let Some(task) = next else {
                return Ok(());
            };
            let completion = self.admit_task(task.options, false, site)?;
            (task.executor)(completion);
        }
    }
}

impl FlowHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Queue an operation from any thread. A parked consumer is woken so
    /// the operation is admitted promptly.
    pub fn enqueue<F>(&self, options: TaskOptions, executor: F) -> Result<()>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let wake = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(FlowError::Closed);
            }
            state.queue.push_back(PendingTask {
                options,
                executor: Box::new(executor),
            });
            claim_wake(&mut state)
        };
        if wake {
            self.shared.send_wake(Wake::Admin);
        }
        Ok(())
    }

    /// End a forced wait.
    pub fn done_adding(&self) -> Result<()> {
        self.shared.done_adding()
    }

    /// Change the concurrency cap. A consumer parked at the old cap
    /// re-checks it.
    pub fn set_max_parallel(&self, max: usize) {
        let wake = {
            let mut state = self.shared.lock();
            state.config.max_parallel = max;
            claim_wake(&mut state)
        };
        if wake {
            self.shared.send_wake(Wake::Admin);
        }
    }

    pub fn unfinished(&self) -> usize {
        self.shared.lock().unfinished()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&FlowEvent) + Send + Sync + 'static,
    {
        self.shared.on_event(Arc::new(listener));
    }
}
