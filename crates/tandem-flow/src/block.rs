// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Units of work.
//!
//! `run` executes a body as a coroutine and drives it from the calling
//! thread until it returns. A body started while another flow's body is
//! running on the same thread becomes that flow's child for error context.

use std::cell::RefCell;
use std::panic::Location;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tandem_rt::channel::Receiver;
use tandem_rt::{Coroutine, CoroutineState, Resumed};
use tracing::{debug, warn};

use crate::config::FlowConfig;
use crate::coordinator::{Flow, FlowShared, Signal, Wake};
use crate::error::{FlowError, Origin, Result};
use crate::generator::Generator;
use crate::registry::ErrorHandler;

thread_local! {
    static CURRENT: RefCell<Option<Flow>> = RefCell::new(None);
}

/// The flow whose body is running on this thread, if any.
pub(crate) fn current() -> Option<Flow> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Marks a flow as current for the lifetime of its body.
struct Entered {
    previous: Option<Flow>,
}

impl Entered {
    fn new(flow: &Flow) -> Self {
        let previous = CURRENT.with(|cell| cell.replace(Some(flow.clone())));
        Self { previous }
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|cell| {
            cell.replace(previous);
        });
    }
}

pub(crate) type Slot<T> = Arc<Mutex<Option<Result<T>>>>;

fn take_slot<T>(slot: &Slot<T>) -> Result<T> {
    slot.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .unwrap_or_else(|| Err(FlowError::Panicked("flow body produced no result".to_string())))
}

/// Outcome of driving a body until it next hands control back.
#[derive(Debug)]
pub(crate) enum Step {
    Emitted(Value),
    Finished,
    Panicked(String),
}

/// Host side of a running body.
pub(crate) struct Driver {
    co: Coroutine<Signal, Wake>,
    wakes: Receiver<Wake>,
    shared: Arc<FlowShared>,
}

impl Driver {
    fn spawn<T, F>(
        shared: Arc<FlowShared>,
        wakes: Receiver<Wake>,
        slot: Slot<T>,
        body: F,
    ) -> Result<Self>
    where
        T: Send + 'static,
        F: FnOnce(&Flow) -> Result<T> + Send + 'static,
    {
        let body_shared = shared.clone();
        let name = format!("tandem-flow-{}", shared.id);
        let co = Coroutine::spawn(name, move |suspender| {
            let flow = Flow::new(body_shared, suspender);
            let outcome = {
                let _entered = Entered::new(&flow);
                body(&flow)
            };
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        })
        .map_err(|e| FlowError::Spawn(e.to_string()))?;

        Ok(Self { co, wakes, shared })
    }

    pub fn shared(&self) -> &Arc<FlowShared> {
        &self.shared
    }

    /// Run the body until it emits a value or ends.
    pub fn advance(&mut self) -> Step {
        let resumed = match self.co.state() {
            CoroutineState::Created => self.co.start(),
            _ => self.co.resume(Wake::Pull),
        };
        self.pump(resumed)
    }

    fn pump(&mut self, mut resumed: Resumed<Signal>) -> Step {
        loop {
            match resumed {
                Resumed::Yielded(Signal::Suspend) => match self.wakes.recv() {
                    Ok(wake) => resumed = self.co.resume(wake),
                    Err(_) => return Step::Panicked("wake channel closed".to_string()),
                },
                Resumed::Yielded(Signal::Emit(value)) => return Step::Emitted(value),
                Resumed::Complete => return Step::Finished,
                Resumed::Panicked(msg) => {
                    warn!(flow = self.shared.id, panic = %msg, "flow body panicked");
                    return Step::Panicked(msg);
                }
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Builder for a unit of work.
pub struct Block {
    location: &'static Location<'static>,
    label: Option<String>,
    config: FlowConfig,
    handler: Option<ErrorHandler>,
}

impl Block {
    #[track_caller]
    pub fn new() -> Self {
        Self {
            location: Location::caller(),
            label: None,
            config: FlowConfig::default(),
            handler: None,
        }
    }

    /// Name the flow in error context.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn config(mut self, config: FlowConfig) -> Self {
        self.config = config;
        self
    }

    /// Called once with the first error the unit of work raises.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&FlowError) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    fn open(self, generator: bool) -> (Arc<FlowShared>, Receiver<Wake>) {
        let parent = current();
        let origin = Origin {
            location: self.location,
            label: self.label,
        };
        let (shared, wakes) =
            FlowShared::new(origin, parent.as_ref().map(Flow::shared), self.config, generator);
        shared.lock().handler = self.handler;
        debug!(
            flow = shared.id,
            parent = parent.as_ref().map(Flow::id),
            generator,
            "flow opened"
        );
        (shared, wakes)
    }

    /// Run `body` to completion on its own coroutine.
    ///
    /// Errors are returned here and also reach the error handler, once.
    pub fn run<T, F>(self, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Flow) -> Result<T> + Send + 'static,
    {
        let (shared, wakes) = self.open(false);
        let slot: Slot<T> = Arc::new(Mutex::new(None));
        let mut driver = match Driver::spawn(shared.clone(), wakes, slot.clone(), body) {
            Ok(driver) => driver,
            Err(err) => return shared.conclude(Err(err)),
        };

        let outcome = match driver.advance() {
            Step::Finished => take_slot(&slot),
            Step::Panicked(msg) => Err(FlowError::Panicked(msg)),
            // Only generator flows can emit.
            Step::Emitted(_) => Err(FlowError::NotGenerator),
        };
        shared.conclude(outcome)
    }

    /// Create a generator whose body starts suspended until the first pull.
    pub fn generator<F>(self, body: F) -> Result<Generator>
    where
        F: FnOnce(&Flow) -> Result<()> + Send + 'static,
    {
        let (shared, wakes) = self.open(true);
        let slot: Slot<()> = Arc::new(Mutex::new(None));
        match Driver::spawn(shared.clone(), wakes, slot.clone(), body) {
            Ok(driver) => Ok(Generator::new(driver, slot)),
            Err(err) => shared.conclude(Err(err)),
        }
    }
}

impl Default for Block {
    #[track_caller]
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("location", &self.location)
            .field("label", &self.label)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Run `body` as a unit of work and return its result.
#[track_caller]
pub fn run<T, F>(body: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Flow) -> Result<T> + Send + 'static,
{
    Block::new().run(body)
}

/// Create a generator driven by `body`. See `Flow::yield_value`.
#[track_caller]
pub fn generator<F>(body: F) -> Result<Generator>
where
    F: FnOnce(&Flow) -> Result<()> + Send + 'static,
{
    Block::new().generator(body)
}

pub(crate) fn finish_step(driver: &Driver, slot: &Slot<()>, step: Step) -> Result<Option<Value>> {
    match step {
        Step::Emitted(value) => Ok(Some(value)),
        Step::Finished => driver.shared().conclude(take_slot(slot)).map(|()| None),
        Step::Panicked(msg) => driver
            .shared()
            .conclude(Err(FlowError::Panicked(msg)))
            .map(|()| None),
    }
}
