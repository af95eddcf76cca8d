// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tandem host runtime.
//!
//! The flow engine needs a host that can create a suspendable computation,
//! suspend it, and resume it with a value. Rust has no ambient fiber
//! primitive, so this crate supplies one on top of OS threads.
//!
//! Components:
//! - coroutine: suspendable computation with a rendezvous handoff
//! - channel:   rendezvous and unbounded message passing
//! - timer:     one-shot cancellable timers, sleep
//! - cancel:    shared cancellation flag

pub mod cancel;
pub mod channel;
pub mod coroutine;
pub mod timer;

pub use cancel::CancelToken;
pub use coroutine::{Coroutine, CoroutineState, Resumed, Suspender};
pub use timer::Timer;
