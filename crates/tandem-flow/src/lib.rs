// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tandem flows.
//!
//! A flow lets one sequential unit of work start any number of
//! callback-style operations and then suspend until some or all of them
//! finish. Results are collected by key, concurrency can be capped, tasks
//! can time out, and failures carry the wait site and the chain of flows
//! they crossed.
//!
//! ```no_run
//! let sum = tandem_flow::run(|flow| {
//!     let a = flow.add_keyed("a")?;
//!     let b = flow.add_keyed("b")?;
//!     std::thread::spawn(move || a.resolve(1));
//!     std::thread::spawn(move || b.resolve(2));
//!     let results = flow.wait_all()?;
//!     Ok(results.value("a").and_then(|v| v.as_i64()).unwrap_or(0)
//!         + results.value("b").and_then(|v| v.as_i64()).unwrap_or(0))
//! })?;
//! assert_eq!(sum, 3);
//! # Ok::<(), tandem_flow::FlowError>(())
//! ```

mod admission;
mod block;
pub mod config;
mod coordinator;
pub mod error;
pub mod event;
mod generator;
mod registry;
pub mod task;

pub use block::{generator, run, Block};
pub use config::{ConfigError, FlowConfig};
pub use coordinator::{Deferred, Flow, FlowHandle};
pub use error::{ContextSegment, Delivery, FlowError, Result, TaskError};
pub use event::FlowEvent;
pub use generator::Generator;
pub use registry::ErrorHandler;
pub use task::{Completion, Gathered, TaskOptions, TaskResult};
