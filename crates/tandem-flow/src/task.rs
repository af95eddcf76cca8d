// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks and their completion handles.
//!
//! A registered task is a `TaskCell`. Its settlement state moves once,
//! from `PENDING` to either `SETTLED` (the completion ran) or `TIMED_OUT`
//! (the timer won). Completions and timers race on that transition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tandem_rt::Timer;
use tracing::{error, trace, warn};

use crate::coordinator::FlowShared;
use crate::error::{FlowError, Result, TaskError};
use crate::event::FlowEvent;

/// Options for registering a task.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub(crate) key: Option<String>,
    pub(crate) response_format: Option<Vec<String>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) timeout_is_error: Option<bool>,
    pub(crate) ignore_error: bool,
    pub(crate) dont_wait: bool,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyed(key: impl Into<String>) -> Self {
        Self::new().key(key)
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Name the completion's values. The result becomes an object mapping
    /// each name to the value in the same position.
    pub fn response_format<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.response_format = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_is_error(mut self, is_error: bool) -> Self {
        self.timeout_is_error = Some(is_error);
        self
    }

    /// Hand a failure back as a value instead of raising it.
    pub fn ignore_error(mut self) -> Self {
        self.ignore_error = true;
        self
    }

    /// Leave the task out of `wait_all`.
    pub fn dont_wait(mut self) -> Self {
        self.dont_wait = true;
        self
    }
}

/// Settled outcome of one task.
#[derive(Debug, Clone)]
pub enum TaskResult {
    Value(Value),
    Failed(TaskError),
}

impl TaskResult {
    pub fn value(&self) -> Option<&Value> {
        match self {
            TaskResult::Value(v) => Some(v),
            TaskResult::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskResult::Failed(e) => Some(e),
            TaskResult::Value(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            TaskResult::Value(v) => Some(v),
            TaskResult::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskResult::Failed(_))
    }
}

/// Results collected by `wait_all`.
#[derive(Debug, Clone)]
pub enum Gathered {
    /// A lone unkeyed task, returned unwrapped.
    Single(TaskResult),
    /// Every keyed task, by key.
    Keyed(BTreeMap<String, TaskResult>),
}

impl Gathered {
    pub fn get(&self, key: &str) -> Option<&TaskResult> {
        match self {
            Gathered::Keyed(map) => map.get(key),
            Gathered::Single(_) => None,
        }
    }

    /// Shorthand for the value stored under `key`.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.get(key).and_then(TaskResult::value)
    }

    pub fn single(&self) -> Option<&TaskResult> {
        match self {
            Gathered::Single(result) => Some(result),
            Gathered::Keyed(_) => None,
        }
    }

    pub fn into_single(self) -> Option<TaskResult> {
        match self {
            Gathered::Single(result) => Some(result),
            Gathered::Keyed(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Gathered::Single(_) => 1,
            Gathered::Keyed(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shape the values a completion was called with.
pub(crate) fn format_values(shape: Option<&[String]>, mut values: Vec<Value>) -> Value {
    match shape {
        Some(names) => {
            let map: Map<String, Value> = names.iter().cloned().zip(values).collect();
            Value::Object(map)
        }
        None => match values.len() {
            0 => Value::Null,
            1 => values.swap_remove(0),
            _ => Value::Array(values),
        },
    }
}

const PENDING: u8 = 0;
const SETTLED: u8 = 1;
const TIMED_OUT: u8 = 2;

/// A registered task.
#[derive(Debug)]
pub(crate) struct TaskCell {
    pub id: u64,
    pub key: String,
    /// Auto-keyed: excluded from keyed results.
    pub hidden: bool,
    pub ignore_error: bool,
    pub dont_wait: bool,
    pub response_format: Option<Vec<String>>,
    pub timeout_is_error: bool,
    pub started: Instant,
    state: AtomicU8,
    timer: Mutex<Option<Timer>>,
}

impl TaskCell {
    pub fn new(
        id: u64,
        key: String,
        hidden: bool,
        options: &TaskOptions,
        timeout_is_error: bool,
    ) -> Self {
        Self {
            id,
            key,
            hidden,
            ignore_error: options.ignore_error,
            dont_wait: options.dont_wait,
            response_format: options.response_format.clone(),
            timeout_is_error,
            started: Instant::now(),
            state: AtomicU8::new(PENDING),
            timer: Mutex::new(None),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    pub fn arm(&self, timer: Timer) {
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
    }

    pub fn has_timer(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn cancel_timer(&self) {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.cancel();
        }
    }

    /// Called from the timer thread.
    pub fn expire(self: &Arc<Self>, flow: &FlowShared) {
        if self
            .state
            .compare_exchange(PENDING, TIMED_OUT, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let elapsed = self.started.elapsed();
        warn!(
            flow = flow.id,
            key = %self.key,
            elapsed_ms = elapsed.as_millis() as u64,
            "task timed out"
        );
        flow.emit(&FlowEvent::TaskTimeout {
            key: self.key.clone(),
            elapsed,
        });

        let result = if self.timeout_is_error {
            TaskResult::Failed(TaskError::timeout(&self.key, elapsed))
        } else {
            TaskResult::Value(format_values(self.response_format.as_deref(), Vec::new()))
        };
        flow.settle(self, result);
    }
}

/// Handle used to report a task's outcome. Cheap to clone and safe to move
/// to another thread.
///
/// Dropping the last clone of a completion that was never invoked logs a
/// warning when nothing else can settle the task: no timer is armed and the
/// flow is still open. Such a task keeps its flow waiting forever.
#[derive(Clone)]
pub struct Completion {
    cell: Arc<TaskCell>,
    flow: Arc<FlowShared>,
    _watch: Arc<DropWatch>,
}

impl Completion {
    pub(crate) fn new(cell: Arc<TaskCell>, flow: Arc<FlowShared>) -> Self {
        let watch = DropWatch {
            cell: cell.clone(),
            flow: flow.clone(),
        };
        Self {
            cell,
            flow,
            _watch: Arc::new(watch),
        }
    }

    pub fn key(&self) -> &str {
        &self.cell.key
    }

    /// Report in callback form: an error slot plus result values.
    ///
    /// A null error counts as success. Strings and other JSON values are
    /// normalized into a `TaskError`.
    pub fn call(&self, error: Option<Value>, values: Vec<Value>) -> Result<()> {
        let result = match error {
            Some(err) if !err.is_null() => {
                TaskResult::Failed(TaskError::from_value(&self.cell.key, err))
            }
            _ => TaskResult::Value(format_values(
                self.cell.response_format.as_deref(),
                values,
            )),
        };
        self.finish(result)
    }

    pub fn succeed(&self, values: Vec<Value>) -> Result<()> {
        self.call(None, values)
    }

    /// Report a single serializable value. A value that fails to serialize
    /// fails the task.
    pub fn resolve<V: Serialize>(&self, value: V) -> Result<()> {
        match serde_json::to_value(value) {
            Ok(value) => self.succeed(vec![value]),
            Err(err) => self.fail(err),
        }
    }

    pub fn fail<E>(&self, err: E) -> Result<()>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.finish(TaskResult::Failed(TaskError::from_error(&self.cell.key, err)))
    }

    pub fn settle<T, E>(&self, outcome: std::result::Result<T, E>) -> Result<()>
    where
        T: Serialize,
        E: std::error::Error + Send + Sync + 'static,
    {
        match outcome {
            Ok(value) => self.resolve(value),
            Err(err) => self.fail(err),
        }
    }

    fn finish(&self, result: TaskResult) -> Result<()> {
        match self.cell.state.compare_exchange(
            PENDING,
            SETTLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(TIMED_OUT) => {
                trace!(flow = self.flow.id, key = %self.cell.key, "late completion ignored");
                return Ok(());
            }
            Err(_) => {
                error!(flow = self.flow.id, key = %self.cell.key, "completion invoked twice");
                return Err(FlowError::CallbackInvokedTwice {
                    key: self.cell.key.clone(),
                });
            }
        }

        self.cell.cancel_timer();
        self.flow.settle(&self.cell, result);
        Ok(())
    }
}

/// Shared by every clone of one completion; dropped with the last one.
struct DropWatch {
    cell: Arc<TaskCell>,
    flow: Arc<FlowShared>,
}

impl DropWatch {
    /// True if the task can no longer finish.
    fn stranded(&self) -> bool {
        self.cell.is_pending() && !self.cell.has_timer() && self.flow.is_open()
    }
}

impl Drop for DropWatch {
    fn drop(&mut self) {
        if self.stranded() {
            warn!(
                flow = self.flow.id,
                key = %self.cell.key,
                "completion dropped without being invoked; the task can never finish"
            );
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("flow", &self.flow.id)
            .field("key", &self.cell.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowConfig;
    use crate::error::Origin;
    use serde_json::json;
    use std::panic::Location;

    fn open_flow() -> Arc<FlowShared> {
        let origin = Origin {
            location: Location::caller(),
            label: None,
        };
        let (flow, _wakes) = FlowShared::new(origin, None, FlowConfig::default(), false);
        flow
    }

    fn watch(flow: &Arc<FlowShared>, key: &str) -> DropWatch {
        let (cell, _) = flow.lock().admit(key.into(), false, &TaskOptions::keyed(key));
        DropWatch {
            cell,
            flow: flow.clone(),
        }
    }

    fn shape(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn zero_values_is_null() {
        assert_eq!(format_values(None, vec![]), Value::Null);
    }

    #[test]
    fn one_value_is_unwrapped() {
        assert_eq!(format_values(None, vec![json!(5)]), json!(5));
    }

    #[test]
    fn several_values_become_an_array() {
        assert_eq!(
            format_values(None, vec![json!(1), json!("two")]),
            json!([1, "two"])
        );
    }

    #[test]
    fn shape_zips_names_and_values() {
        let names = shape(&["a", "b"]);
        assert_eq!(
            format_values(Some(&names), vec![json!(1), json!(2)]),
            json!({ "a": 1, "b": 2 })
        );
    }

    #[test]
    fn shape_truncates_to_the_shorter_side() {
        let names = shape(&["a", "b", "c"]);
        assert_eq!(
            format_values(Some(&names), vec![json!(1)]),
            json!({ "a": 1 })
        );
        let names = shape(&["a"]);
        assert_eq!(
            format_values(Some(&names), vec![json!(1), json!(2)]),
            json!({ "a": 1 })
        );
    }

    #[test]
    fn gathered_accessors() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), TaskResult::Value(json!(1)));
        let gathered = Gathered::Keyed(map);
        assert_eq!(gathered.value("a"), Some(&json!(1)));
        assert!(gathered.single().is_none());
        assert_eq!(gathered.len(), 1);

        let single = Gathered::Single(TaskResult::Value(json!("x")));
        assert_eq!(
            single.into_single().and_then(TaskResult::into_value),
            Some(json!("x"))
        );
    }

    #[test]
    fn unsettled_untimed_task_is_stranded() {
        let flow = open_flow();
        let w = watch(&flow, "a");
        assert!(w.stranded());

        let completion = Completion::new(w.cell.clone(), flow.clone());
        completion.resolve(1).unwrap();
        assert!(!w.stranded());
    }

    #[test]
    fn armed_timer_or_closed_flow_is_not_stranded() {
        let flow = open_flow();
        let w = watch(&flow, "a");
        w.cell.arm(Timer::after(Duration::from_secs(60), || {}).unwrap());
        assert!(!w.stranded());
        w.cell.cancel_timer();

        let w = watch(&flow, "b");
        flow.close();
        assert!(!w.stranded());
    }

    #[test]
    fn dropping_clones_keeps_the_watch_until_the_last() {
        let flow = open_flow();
        let (cell, _) = flow.lock().admit("a".into(), false, &TaskOptions::keyed("a"));
        let completion = Completion::new(cell, flow.clone());
        let copy = completion.clone();
        assert_eq!(Arc::strong_count(&completion._watch), 2);
        drop(completion);
        assert_eq!(Arc::strong_count(&copy._watch), 1);
        copy.resolve("done").unwrap();
    }
}
