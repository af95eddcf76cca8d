// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task bookkeeping for one flow.
//!
//! Everything here is plain state behind the flow's mutex. Suspension and
//! wakeups live in the coordinator.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::FlowConfig;
use crate::error::{FlowError, TaskError};
use crate::task::{Completion, Gathered, TaskCell, TaskOptions, TaskResult};

/// Key given to the first unkeyed task so a lone result can be returned
/// unwrapped.
pub(crate) const DEFAULT_KEY: &str = "__tandem_default__";

static AUTO_KEY: AtomicU64 = AtomicU64::new(1);

fn auto_key() -> String {
    format!("_tandem_{}", AUTO_KEY.fetch_add(1, Ordering::Relaxed))
}

pub type ErrorHandler = Arc<dyn Fn(&FlowError) + Send + Sync>;

pub(crate) type Executor = Box<dyn FnOnce(Completion) + Send>;

/// A queued operation that has not been admitted yet.
pub(crate) struct PendingTask {
    pub options: TaskOptions,
    pub executor: Executor,
}

#[derive(Debug, Clone)]
pub(crate) struct FinishedTask {
    pub key: String,
    pub result: TaskResult,
    pub ignore_error: bool,
    pub dont_wait: bool,
    pub hidden: bool,
    /// Already subtracted from the counters by `get`.
    pub uncounted: bool,
    /// Completion order.
    pub seq: u64,
}

impl FinishedTask {
    /// The error this task raises, if it failed and doesn't ignore errors.
    pub fn raised(&self) -> Option<&TaskError> {
        if self.ignore_error {
            None
        } else {
            self.result.error()
        }
    }
}

pub(crate) struct FlowState {
    pub outstanding: usize,
    pub finished: usize,
    pub finished_tasks: HashMap<String, FinishedTask>,
    pub live: HashMap<u64, Arc<TaskCell>>,
    pub queue: VecDeque<PendingTask>,
    pub force_wait: bool,
    /// False while the consumer is parked waiting for a wake.
    pub running: bool,
    pub closed: bool,
    pub config: FlowConfig,
    /// Timeout for tasks registered without one.
    pub default_timeout: Option<Duration>,
    pub handler: Option<ErrorHandler>,
    next_id: u64,
    next_seq: u64,
}

impl FlowState {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            outstanding: 0,
            finished: 0,
            finished_tasks: HashMap::new(),
            live: HashMap::new(),
            queue: VecDeque::new(),
            force_wait: false,
            running: true,
            closed: false,
            default_timeout: config.task_timeout(),
            config,
            handler: None,
            next_id: 1,
            next_seq: 1,
        }
    }

    /// Pick the key for a new task. Returns the key and whether it is hidden
    /// from keyed results.
    pub fn assign_key(&self, requested: Option<String>, force_auto: bool) -> (String, bool) {
        match requested {
            Some(key) if !force_auto => (key, false),
            _ if !force_auto && self.outstanding == 0 => (DEFAULT_KEY.to_string(), false),
            _ => (auto_key(), true),
        }
    }

    /// Count and track a task. Returns the cell and the timeout to arm.
    pub fn admit(
        &mut self,
        key: String,
        hidden: bool,
        options: &TaskOptions,
    ) -> (Arc<TaskCell>, Option<Duration>) {
        let id = self.next_id;
        self.next_id += 1;

        let timeout = options
            .timeout
            .filter(|d| !d.is_zero())
            .or(self.default_timeout);
        let timeout_is_error = options
            .timeout_is_error
            .unwrap_or(self.config.timeout_is_error);

        let cell = Arc::new(TaskCell::new(id, key, hidden, options, timeout_is_error));
        if !cell.dont_wait {
            self.outstanding += 1;
        }
        self.live.insert(id, cell.clone());
        (cell, timeout)
    }

    pub fn record(&mut self, cell: &TaskCell, result: TaskResult) {
        self.live.remove(&cell.id);
        if !cell.dont_wait {
            self.finished += 1;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.finished_tasks.insert(
            cell.key.clone(),
            FinishedTask {
                key: cell.key.clone(),
                result,
                ignore_error: cell.ignore_error,
                dont_wait: cell.dont_wait,
                hidden: cell.hidden,
                uncounted: false,
                seq,
            },
        );
    }

    pub fn should_suspend(&self) -> bool {
        self.finished < self.outstanding || self.force_wait || !self.queue.is_empty()
    }

    pub fn is_quiescent(&self) -> bool {
        !self.should_suspend()
    }

    pub fn unfinished(&self) -> usize {
        self.outstanding.saturating_sub(self.finished)
    }

    pub fn at_capacity(&self) -> bool {
        let cap = self.config.max_parallel;
        cap > 0 && self.unfinished() >= cap
    }

    /// Whether waiting on `key` could ever finish.
    pub fn knows(&self, key: &str) -> bool {
        self.finished_tasks.contains_key(key)
            || self.live.values().any(|cell| cell.key == key)
            || self
                .queue
                .iter()
                .any(|task| task.options.key.as_deref() == Some(key))
            || self.force_wait
    }

    /// Read a finished task, uncounting it the first time. With `keep` the
    /// entry stays for later reads.
    pub fn take(&mut self, key: &str, keep: bool) -> Option<FinishedTask> {
        let entry = self.finished_tasks.get_mut(key)?;
        if !entry.dont_wait && !entry.uncounted {
            entry.uncounted = true;
            self.outstanding = self.outstanding.saturating_sub(1);
            self.finished = self.finished.saturating_sub(1);
        }
        if keep {
            Some(entry.clone())
        } else {
            self.finished_tasks.remove(key)
        }
    }

    pub fn forget(&mut self, key: &str) -> bool {
        self.finished_tasks.remove(key).is_some()
    }

    /// Collect every waited-on result and reset the counters.
    ///
    /// The first failure that doesn't ignore errors, in completion order,
    /// is returned instead of the results.
    pub fn gather(&mut self) -> Result<Gathered, TaskError> {
        let single = self.outstanding == 1
            && self
                .finished_tasks
                .get(DEFAULT_KEY)
                .map_or(false, |task| !task.dont_wait);

        let (mut collected, kept): (Vec<FinishedTask>, Vec<FinishedTask>) = self
            .finished_tasks
            .drain()
            .map(|(_, task)| task)
            .partition(|task| !task.dont_wait);
        self.finished_tasks = kept.into_iter().map(|t| (t.key.clone(), t)).collect();
        collected.sort_by_key(|task| task.seq);

        self.outstanding = 0;
        self.finished = 0;

        if let Some(err) = collected.iter().find_map(FinishedTask::raised) {
            return Err(err.clone());
        }

        if single {
            if let Some(task) = collected.into_iter().find(|t| t.key == DEFAULT_KEY) {
                return Ok(Gathered::Single(task.result));
            }
            return Ok(Gathered::Single(TaskResult::Value(serde_json::Value::Null)));
        }

        let map: BTreeMap<String, TaskResult> = collected
            .into_iter()
            .filter(|task| !task.hidden && task.key != DEFAULT_KEY)
            .map(|task| (task.key, task.result))
            .collect();
        Ok(Gathered::Keyed(map))
    }

    pub fn next_pending(&mut self) -> Option<PendingTask> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settle(state: &mut FlowState, cell: &Arc<TaskCell>, result: TaskResult) {
        state.record(cell, result);
    }

    fn add(state: &mut FlowState, options: TaskOptions) -> Arc<TaskCell> {
        let (key, hidden) = state.assign_key(options.key.clone(), false);
        state.admit(key, hidden, &options).0
    }

    #[test]
    fn first_unkeyed_task_gets_default_key() {
        let mut state = FlowState::new(FlowConfig::default());
        let first = add(&mut state, TaskOptions::new());
        let second = add(&mut state, TaskOptions::new());
        assert_eq!(first.key, DEFAULT_KEY);
        assert!(!first.hidden);
        assert!(second.hidden);
        assert_ne!(second.key, DEFAULT_KEY);
    }

    #[test]
    fn lone_default_task_is_returned_unwrapped() {
        let mut state = FlowState::new(FlowConfig::default());
        let cell = add(&mut state, TaskOptions::new());
        assert!(state.should_suspend());
        settle(&mut state, &cell, TaskResult::Value(json!(7)));
        assert!(state.is_quiescent());

        let gathered = state.gather().unwrap();
        assert_eq!(gathered.single().and_then(TaskResult::value), Some(&json!(7)));
        assert_eq!((state.outstanding, state.finished), (0, 0));
    }

    #[test]
    fn keyed_results_skip_hidden_and_default() {
        let mut state = FlowState::new(FlowConfig::default());
        let default = add(&mut state, TaskOptions::new());
        let a = add(&mut state, TaskOptions::keyed("a"));
        let hidden = add(&mut state, TaskOptions::new());
        settle(&mut state, &hidden, TaskResult::Value(json!(0)));
        settle(&mut state, &a, TaskResult::Value(json!(1)));
        settle(&mut state, &default, TaskResult::Value(json!(2)));

        let gathered = state.gather().unwrap();
        assert_eq!(gathered.len(), 1);
        assert_eq!(gathered.value("a"), Some(&json!(1)));
    }

    #[test]
    fn fire_and_forget_tasks_stay_behind() {
        let mut state = FlowState::new(FlowConfig::default());
        let bg = add(&mut state, TaskOptions::keyed("bg").dont_wait());
        assert_eq!(state.outstanding, 0);
        settle(&mut state, &bg, TaskResult::Value(json!(1)));
        assert_eq!(state.finished, 0);

        let gathered = state.gather().unwrap();
        assert!(gathered.is_empty());
        assert!(state.finished_tasks.contains_key("bg"));
    }

    #[test]
    fn non_ignored_error_wins_over_ignored() {
        let mut state = FlowState::new(FlowConfig::default());
        let ignored = add(&mut state, TaskOptions::keyed("soft").ignore_error());
        let hard = add(&mut state, TaskOptions::keyed("hard"));
        settle(
            &mut state,
            &ignored,
            TaskResult::Failed(TaskError::from_value("soft", json!("meh"))),
        );
        settle(
            &mut state,
            &hard,
            TaskResult::Failed(TaskError::from_value("hard", json!("boom"))),
        );

        let err = state.gather().unwrap_err();
        assert_eq!(err.key(), "hard");
    }

    #[test]
    fn ignored_errors_come_back_as_values() {
        let mut state = FlowState::new(FlowConfig::default());
        let soft = add(&mut state, TaskOptions::keyed("soft").ignore_error());
        let ok = add(&mut state, TaskOptions::keyed("ok"));
        settle(
            &mut state,
            &soft,
            TaskResult::Failed(TaskError::from_value("soft", json!("meh"))),
        );
        settle(&mut state, &ok, TaskResult::Value(json!(1)));

        let gathered = state.gather().unwrap();
        assert!(gathered.get("soft").map_or(false, TaskResult::is_failed));
        assert_eq!(gathered.value("ok"), Some(&json!(1)));
    }

    #[test]
    fn take_uncounts_once() {
        let mut state = FlowState::new(FlowConfig::default());
        let a = add(&mut state, TaskOptions::keyed("a"));
        let _b = add(&mut state, TaskOptions::keyed("b"));
        settle(&mut state, &a, TaskResult::Value(json!(1)));
        assert_eq!((state.outstanding, state.finished), (2, 1));

        assert!(state.take("a", true).is_some());
        assert!(state.take("a", true).is_some());
        assert_eq!((state.outstanding, state.finished), (1, 0));
        assert!(state.take("a", false).is_some());
        assert!(state.take("a", false).is_none());
    }

    #[test]
    fn capacity_counts_unfinished_tasks() {
        let mut config = FlowConfig::default();
        config.max_parallel = 2;
        let mut state = FlowState::new(config);
        let a = add(&mut state, TaskOptions::keyed("a"));
        assert!(!state.at_capacity());
        let _b = add(&mut state, TaskOptions::keyed("b"));
        assert!(state.at_capacity());
        settle(&mut state, &a, TaskResult::Value(json!(1)));
        assert!(!state.at_capacity());
    }

    #[test]
    fn knows_live_finished_and_queued_keys() {
        let mut state = FlowState::new(FlowConfig::default());
        assert!(!state.knows("a"));
        let a = add(&mut state, TaskOptions::keyed("a"));
        assert!(state.knows("a"));
        settle(&mut state, &a, TaskResult::Value(json!(1)));
        assert!(state.knows("a"));
        state.queue.push_back(PendingTask {
            options: TaskOptions::keyed("q"),
            executor: Box::new(|_| {}),
        });
        assert!(state.knows("q"));
    }

    #[test]
    fn default_timeout_comes_from_config() {
        let mut config = FlowConfig::default();
        config.task_timeout_ms = Some(40);
        let mut state = FlowState::new(config);
        let (_, timeout) = state.admit("a".into(), false, &TaskOptions::new());
        assert_eq!(timeout, Some(Duration::from_millis(40)));
        let (_, timeout) = state.admit(
            "b".into(),
            false,
            &TaskOptions::new().timeout(Duration::from_millis(5)),
        );
        assert_eq!(timeout, Some(Duration::from_millis(5)));
    }

    #[test]
    fn sub_millisecond_default_timeout_is_armed() {
        let mut state = FlowState::new(FlowConfig::default());
        state.default_timeout = Some(Duration::from_micros(900));
        let (_, timeout) = state.admit("a".into(), false, &TaskOptions::new());
        assert_eq!(timeout, Some(Duration::from_micros(900)));
    }
}
