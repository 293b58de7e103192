// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! # evio - a single-threaded, multi-backend event reactor for Linux.
//!
//! ## What is evio
//!
//! evio multiplexes file-descriptor readiness, timers, POSIX signals and
//! deferred/cross-thread tasks into one dispatch loop. One OS thread
//! drives a [`Loop`]; callbacks run to completion, cooperatively, on that
//! thread. Two polling engines are built in - `epoll` (the default, one
//! wait call returns a ready batch regardless of watch-set size) and
//! `select` (a portable readiness-set fallback) - behind one engine
//! contract, so further engines can be added without touching the shared
//! core.
//!
//! ## Dispatching events
//!
//! Handles are created from the loop and armed with a callback:
//!
//! ```
//! use evio::{EventMode, Loop, RunMode};
//! use std::time::Duration;
//!
//! let lp = Loop::new().unwrap();
//! let tick = lp.new_timer_event("tick");
//! tick.init(Duration::from_millis(10), EventMode::Persist).unwrap();
//! tick.set_callback(|| println!("tick"));
//! tick.enable().unwrap();
//!
//! lp.exit_loop(Duration::from_millis(55));
//! lp.run_loop(RunMode::Forever);
//! ```
//!
//! ## Talking to the loop from elsewhere
//!
//! Everything except [`Loop::run_in_loop`] (and the [`Remote`] handle it
//! comes from) assumes the loop's own thread. `Remote` is `Send + Sync`
//! and wakes a blocked loop through a dedicated eventfd:
//!
//! ```
//! use evio::{Loop, RunMode};
//! use std::time::Duration;
//!
//! let lp = Loop::new().unwrap();
//! let remote = lp.remote();
//! let worker = std::thread::spawn(move || {
//!     remote.run_in_loop(|| println!("from another thread"), "hello");
//! });
//!
//! lp.exit_loop(Duration::from_millis(20));
//! lp.run_loop(RunMode::Forever);
//! worker.join().unwrap();
//! ```
//!
//! ## Diagnostics
//!
//! The loop accounts for its own health: [`Loop::stat`] snapshots
//! iteration counts, dispatch costs and queue depths, and the
//! [`WaterLine`] thresholds turn anomalies (slow callbacks, deep queues,
//! late timers, slow cross-thread wakes) into `log` warnings without ever
//! changing behavior.

mod error;
mod events;
mod free_list;
mod reactor;
mod runqueue;
mod signals;
mod stat;
mod sys;
mod timers;

pub use error::{Error, Result};
pub use events::{EventMode, FdEvent, Readiness, SignalEvent, TimerEvent};
pub use reactor::{Loop, RunMode};
pub use runqueue::{Remote, RunId};
pub use stat::{Stat, WaterLine};

/// Signal numbers accepted by [`SignalEvent::init`], re-exported from
/// [`nix`](https://docs.rs/nix).
pub use nix::sys::signal::Signal;
