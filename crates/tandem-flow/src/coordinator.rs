// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspension coordinator.
//!
//! A `Flow` lives on its unit of work's coroutine thread. Waiting parks the
//! coroutine with `Signal::Suspend`; the driver on the host side blocks on
//! the wake channel and resumes the body with whatever woke it. Exactly one
//! wake is sent per park: whoever flips `running` back to true sends it.

use std::panic::Location;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tandem_rt::channel::{self, Receiver, Sender};
use tandem_rt::Suspender;
use tracing::{debug, trace, warn};

use crate::config::FlowConfig;
use crate::error::{ContextSegment, FlowError, Origin, Result};
use crate::event::{FlowEvent, Listener, Listeners};
use crate::registry::{ErrorHandler, FlowState};
use crate::task::{Completion, Gathered, TaskCell, TaskOptions, TaskResult};

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Why a parked body was resumed.
#[derive(Debug)]
pub(crate) enum Wake {
    /// A task settled while the body was parked.
    Task { key: String },
    /// Queue, forced wait, or capacity changed from outside.
    Admin,
    /// A generator's consumer asked for the next value.
    Pull,
}

/// What a body hands its host when it suspends.
#[derive(Debug)]
pub(crate) enum Signal {
    Suspend,
    Emit(Value),
}

/// State shared between a flow, its completions, timers and handles.
pub(crate) struct FlowShared {
    pub id: u64,
    pub origin: Origin,
    parent: Option<Weak<FlowShared>>,
    pub generator: bool,
    state: Mutex<FlowState>,
    wakes: Sender<Wake>,
    listeners: Listeners,
}

impl FlowShared {
    pub fn new(
        origin: Origin,
        parent: Option<&Arc<FlowShared>>,
        config: FlowConfig,
        generator: bool,
    ) -> (Arc<Self>, Receiver<Wake>) {
        let (wakes, woken) = channel::unbounded();
        let shared = Arc::new(Self {
            id: NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed),
            origin,
            parent: parent.map(Arc::downgrade),
            generator,
            state: Mutex::new(FlowState::new(config)),
            wakes,
            listeners: Listeners::default(),
        });
        (shared, woken)
    }

    pub fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether completions are still accepted. Never blocks: a contended
    /// lock counts as open.
    pub fn is_open(&self) -> bool {
        match self.state.try_lock() {
            Ok(state) => !state.closed,
            Err(TryLockError::Poisoned(poisoned)) => !poisoned.into_inner().closed,
            Err(TryLockError::WouldBlock) => true,
        }
    }

    /// Record a settled task and wake the consumer if it is parked.
    pub fn settle(&self, cell: &TaskCell, result: TaskResult) {
        let wake = {
            let mut state = self.lock();
            if state.closed {
                state.live.remove(&cell.id);
                trace!(flow = self.id, key = %cell.key, "completion after flow closed ignored");
                return;
            }
            state.record(cell, result);
            claim_wake(&mut state)
        };

        debug!(flow = self.id, key = %cell.key, resumed = wake, "task finished");
        // Listeners hear about the task before the consumer can move on.
        self.emit(&FlowEvent::TaskFinished {
            key: cell.key.clone(),
        });
        if wake {
            self.send_wake(Wake::Task {
                key: cell.key.clone(),
            });
        }
    }

    pub fn done_adding(&self) -> Result<()> {
        let wake = {
            let mut state = self.lock();
            if !state.force_wait {
                return Err(FlowError::NotForceWaiting);
            }
            state.force_wait = false;
            claim_wake(&mut state)
        };
        if wake {
            self.send_wake(Wake::Admin);
        }
        Ok(())
    }

    pub fn send_wake(&self, wake: Wake) {
        // The receiver lives as long as the driver; after that nobody waits.
        let _ = self.wakes.send(wake);
    }

    pub fn emit(&self, event: &FlowEvent) {
        self.listeners.emit(event);
    }

    pub fn on_event(&self, listener: Listener) {
        self.listeners.add(listener);
    }

    /// End of the unit of work. Pending timers are cancelled and anything
    /// that settles afterwards is dropped.
    pub fn close(&self) {
        let (abandoned, queued): (Vec<Arc<TaskCell>>, _) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let queued = std::mem::take(&mut state.queue);
            (state.live.drain().map(|(_, cell)| cell).collect(), queued)
        };
        // Queued executors may own completions; drop them unlocked.
        drop(queued);
        for cell in &abandoned {
            cell.cancel_timer();
        }
        debug!(flow = self.id, abandoned = abandoned.len(), "flow closed");
        self.emit(&FlowEvent::End);
    }

    fn origin_segment(&self) -> ContextSegment {
        ContextSegment::FlowOrigin {
            flow: self.id,
            location: self.origin.location,
            label: self.origin.label.clone(),
        }
    }

    /// This flow's origin followed by each live ancestor's.
    pub fn lineage(&self) -> Vec<ContextSegment> {
        let mut segments = vec![self.origin_segment()];
        let mut next = self.parent.as_ref().and_then(Weak::upgrade);
        while let Some(flow) = next {
            segments.push(flow.origin_segment());
            next = flow.parent.as_ref().and_then(Weak::upgrade);
        }
        segments
    }

    /// Hand an error to the error handler. An error that already reached
    /// a handler is not reported again.
    pub fn deliver(&self, err: &FlowError) {
        let Some(handler) = self.lock().handler.clone() else {
            return;
        };
        if let Some(delivery) = err.delivery() {
            if !delivery.claim() {
                trace!(flow = self.id, error = %err, "error already reported");
                return;
            }
        }
        handler(err);
    }

    /// Finish the unit of work with the body's outcome.
    pub fn conclude<T>(&self, result: Result<T>) -> Result<T> {
        let result = result.map_err(|mut err| {
            err.attach_lineage(&self.lineage());
            debug!(flow = self.id, error = %err, "flow failed");
            self.deliver(&err);
            err
        });
        self.close();
        result
    }
}

/// Flip a parked consumer back to running. True if the caller must send
/// the wake.
pub(crate) fn claim_wake(state: &mut FlowState) -> bool {
    if state.running {
        false
    } else {
        state.running = true;
        true
    }
}

/// The consumer side of a unit of work.
///
/// Handed to the body of `run` and `generator`. A `Flow` stays on the
/// thread running its body; use `handle()` to reach it from elsewhere.
#[derive(Clone)]
pub struct Flow {
    inner: Rc<FlowInner>,
}

struct FlowInner {
    shared: Arc<FlowShared>,
    suspender: Suspender<Signal, Wake>,
}

impl Flow {
    pub(crate) fn new(shared: Arc<FlowShared>, suspender: Suspender<Signal, Wake>) -> Self {
        Self {
            inner: Rc::new(FlowInner { shared, suspender }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<FlowShared> {
        &self.inner.shared
    }

    pub fn id(&self) -> u64 {
        self.inner.shared.id
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.shared.origin.label.as_deref()
    }

    /// Tasks registered but not yet finished.
    pub fn unfinished(&self) -> usize {
        self.inner.shared.lock().unfinished()
    }

    pub fn max_parallel(&self) -> usize {
        self.inner.shared.lock().config.max_parallel
    }

    /// Cap the number of tasks in flight. 0 removes the cap.
    pub fn set_max_parallel(&self, max: usize) {
        self.inner.shared.lock().config.max_parallel = max;
    }

    /// Timeout for tasks registered without one. `None` or zero disables it.
    pub fn set_default_timeout(&self, timeout: Option<Duration>) {
        self.inner.shared.lock().default_timeout = timeout.filter(|d| !d.is_zero());
    }

    pub fn set_timeout_is_error(&self, is_error: bool) {
        self.inner.shared.lock().config.timeout_is_error = is_error;
    }

    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&FlowError) + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(handler);
        self.inner.shared.lock().handler = Some(handler);
    }

    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&FlowEvent) + Send + Sync + 'static,
    {
        self.inner.shared.on_event(Arc::new(listener));
    }

    pub fn handle(&self) -> FlowHandle {
        FlowHandle {
            shared: self.inner.shared.clone(),
        }
    }

    /// Park if `cond` holds. The check and the switch to "not running"
    /// happen under one lock so a completion can't slip in between.
    pub(crate) fn park_if<C>(&self, site: &'static Location<'static>, cond: C) -> Result<bool>
    where
        C: Fn(&FlowState) -> bool,
    {
        {
            let mut state = self.inner.shared.lock();
            if !cond(&state) {
                return Ok(false);
            }
            state.running = false;
        }

        trace!(flow = self.id(), "suspending");
        let wake = self.inner.suspender.suspend(Signal::Suspend);
        trace!(flow = self.id(), ?wake, "resumed");
        self.observe(site, wake)?;
        Ok(true)
    }

    /// Surface the failure of the task that woke us, if it doesn't ignore
    /// errors. The task is consumed.
    fn observe(&self, site: &'static Location<'static>, wake: Wake) -> Result<()> {
        let Wake::Task { key } = wake else {
            return Ok(());
        };

        let failed = {
            let mut state = self.inner.shared.lock();
            let raises = state
                .finished_tasks
                .get(&key)
                .map_or(false, |task| task.raised().is_some());
            if raises {
                state.take(&key, false)
            } else {
                None
            }
        };

        match failed.map(|task| task.result) {
            Some(TaskResult::Failed(mut err)) => {
                err.push_wait_site(site);
                Err(self.raise(err.into()))
            }
            _ => Ok(()),
        }
    }

    /// Attach flow context to a task failure and report it to the handler.
    pub(crate) fn raise(&self, mut err: FlowError) -> FlowError {
        let shared = &self.inner.shared;
        err.attach_lineage(&shared.lineage());
        debug!(flow = shared.id, error = %err, "raising task error");
        shared.deliver(&err);
        err
    }

    /// Wait until every registered task has finished and collect results.
    ///
    /// A lone unkeyed task comes back as `Gathered::Single`. Otherwise the
    /// keyed results are returned; auto-keyed and fire-and-forget tasks are
    /// left out. The first failure that doesn't ignore errors is raised.
    #[track_caller]
    pub fn wait_all(&self) -> Result<Gathered> {
        self.wait_all_at(Location::caller())
    }

    fn wait_all_at(&self, site: &'static Location<'static>) -> Result<Gathered> {
        self.drain(site)?;
        loop {
            let parked = self.park_if(site, |s| s.queue.is_empty() && s.should_suspend())?;
            if !parked && self.inner.shared.lock().is_quiescent() {
                break;
            }
            self.drain(site)?;
        }

        let gathered = self.inner.shared.lock().gather();
        gathered.map_err(|err| self.raise(err.into()))
    }

    /// Wait for one task and consume its result.
    #[track_caller]
    pub fn wait_for(&self, key: &str) -> Result<TaskResult> {
        self.wait_key(key, false, Location::caller())
    }

    /// Like `wait_for`, but the result stays available for later reads.
    #[track_caller]
    pub fn get(&self, key: &str) -> Result<TaskResult> {
        self.wait_key(key, true, Location::caller())
    }

    pub(crate) fn wait_key(
        &self,
        key: &str,
        keep: bool,
        site: &'static Location<'static>,
    ) -> Result<TaskResult> {
        self.drain(site)?;
        loop {
            {
                let state = self.inner.shared.lock();
                if state.finished_tasks.contains_key(key) {
                    break;
                }
                if state.queue.is_empty() && !state.knows(key) {
                    return Err(FlowError::UnknownKey {
                        key: key.to_string(),
                    });
                }
            }
            self.park_if(site, |s| {
                s.queue.is_empty() && !s.finished_tasks.contains_key(key)
            })?;
            self.drain(site)?;
        }

        let task = self.inner.shared.lock().take(key, keep);
        let Some(task) = task else {
            return Err(FlowError::UnknownKey {
                key: key.to_string(),
            });
        };
        match task.raised() {
            Some(err) => Err(self.raise(err.clone().into())),
            None => Ok(task.result),
        }
    }

    /// Drop a finished result without reading it.
    pub fn forget(&self, key: &str) -> bool {
        self.inner.shared.lock().forget(key)
    }

    /// Keep waiting, even with nothing outstanding, until `done_adding`.
    /// Collects results like `wait_all`.
    #[track_caller]
    pub fn force_wait_until_done_adding(&self) -> Result<Gathered> {
        self.inner.shared.lock().force_wait = true;
        self.wait_all_at(Location::caller())
    }

    pub fn done_adding(&self) -> Result<()> {
        self.inner.shared.done_adding()
    }

    /// Start an operation and wait for it in one step.
    #[track_caller]
    pub fn call<F>(&self, options: TaskOptions, executor: F) -> Result<TaskResult>
    where
        F: FnOnce(Completion),
    {
        let site = Location::caller();
        let completion = self.admit_task(options.dont_wait(), true, site)?;
        let key = completion.key().to_string();
        executor(completion);
        self.wait_key(&key, false, site)
    }

    /// Start an operation now and read its result later.
    #[track_caller]
    pub fn defer<F>(&self, options: TaskOptions, executor: F) -> Result<Deferred<'_>>
    where
        F: FnOnce(Completion),
    {
        let completion = self.admit_task(options.dont_wait(), true, Location::caller())?;
        let key = completion.key().to_string();
        executor(completion);
        Ok(Deferred {
            flow: self,
            key,
            outcome: None,
        })
    }

    /// Hand a value to whoever is pulling this generator and suspend until
    /// the next pull.
    pub fn yield_value<V: Serialize>(&self, value: V) -> Result<()> {
        if !self.inner.shared.generator {
            return Err(FlowError::NotGenerator);
        }
        let value = serde_json::to_value(value)?;
        match self.inner.suspender.suspend(Signal::Emit(value)) {
            Wake::Pull => Ok(()),
            other => {
                warn!(flow = self.id(), wake = ?other, "generator resumed without a pull");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id())
            .field("label", &self.label())
            .finish()
    }
}

/// A started operation whose result is read on demand.
pub struct Deferred<'f> {
    flow: &'f Flow,
    key: String,
    outcome: Option<Result<TaskResult>>,
}

impl Deferred<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the result the first time; later calls return the same one.
    #[track_caller]
    pub fn result(&mut self) -> Result<&TaskResult> {
        let site = Location::caller();
        let flow = self.flow;
        let key = &self.key;
        match self
            .outcome
            .get_or_insert_with(|| flow.wait_key(key, false, site))
        {
            Ok(result) => Ok(result),
            Err(err) => Err(err.clone()),
        }
    }
}

/// Thread-safe handle to a flow, for use outside its body.
#[derive(Clone)]
pub struct FlowHandle {
    pub(crate) shared: Arc<FlowShared>,
}

impl std::fmt::Debug for FlowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHandle")
            .field("id", &self.shared.id)
            .finish()
    }
}
