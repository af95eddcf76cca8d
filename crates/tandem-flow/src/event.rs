// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Flow lifecycle events.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// A task settled, either by its completion or by its timeout.
    TaskFinished { key: String },
    /// A task's timer fired before it completed.
    TaskTimeout { key: String, elapsed: Duration },
    /// The unit of work returned and the flow closed.
    End,
}

pub type Listener = Arc<dyn Fn(&FlowEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Listeners {
    inner: Mutex<Vec<Listener>>,
}

impl Listeners {
    pub fn add(&self, listener: Listener) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Notify every listener. Listeners run outside the lock so they may
    /// subscribe further listeners or touch the flow.
    pub fn emit(&self, event: &FlowEvent) {
        let snapshot: Vec<Listener> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in snapshot {
            listener(event);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Listeners").field("count", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_listener_sees_every_event() {
        let listeners = Listeners::default();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let h = hits.clone();
            listeners.add(Arc::new(move |_event: &FlowEvent| {
                h.fetch_add(1, Ordering::SeqCst);
            }));
        }
        listeners.emit(&FlowEvent::End);
        listeners.emit(&FlowEvent::TaskFinished { key: "a".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }
}
