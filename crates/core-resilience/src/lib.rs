//! cda Core Resilience: pure-logic polling primitives
//!
//! # Overview
//!
//! Provisioning a cluster means waiting on things that happen elsewhere: a
//! host rebooting, an install backend discovering nodes, a cluster API
//! marking workers ready. This crate provides the two loops the orchestrator
//! builds on:
//!
//! - **PollLoop**: call a step at a fixed interval until it is ready, it
//!   fails, or an optional attempt/deadline bound is hit
//! - **Known-state wait**: poll a per-node status lookup until every node
//!   reports the ready literal, aborting at once on the error literal
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of SSH, install backends
//! or cluster APIs. Callers pass closures; intervals are plain configuration
//! so tests can run with a zero interval.
//!
//! # Usage Example
//!
//! ```
//! use cda_core_resilience::{Poll, PollConfig, PollLoop};
//! use std::time::Duration;
//!
//! let mut seen = 0;
//! let value: Result<u32, cda_core_resilience::PollError<String>> =
//!     PollLoop::new(PollConfig::every(Duration::ZERO)).run(|_| {
//!         seen += 1;
//!         Ok(if seen == 3 { Poll::Ready(42) } else { Poll::Pending })
//!     });
//! assert_eq!(value.unwrap(), 42);
//! ```

pub mod error;
pub mod known_state;
pub mod poll;

// Re-export main types for convenience
pub use error::{KnownStateError, PollError};
pub use known_state::{wait_known_state, StatusSnapshot, ERROR_STATUS, READY_STATUS};
pub use poll::{Poll, PollConfig, PollLoop};
