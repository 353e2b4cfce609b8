//! # Adventure Orchestration Core
//!
//! Event-driven runtime coordinating a repeating phased pipeline: competing
//! LLM agents design a 3D scene, a judge panel picks a winner, and the
//! winning plan executes against external simulation services.
//!
//! ## Architecture
//!
//! The core follows a single-coordinator model: the Event Bus and Story
//! State are owned by a single `tokio::sync::Mutex`-guarded value, called
//! via `&mut self`, the same shape the rest of the runtime's subsystems use.
//! ```text
//!                    ┌─────────────────────────────────┐
//!   bus events   →   │           Event Bus              │
//!                    │  ┌─────────┐ ┌─────────┐        │
//!                    │  │  Story  │ │  Token  │        │
//!                    │  │  State  │ │ Ledger  │        │
//!                    │  └─────────┘ └─────────┘        │
//!                    │  ┌─────────┐ ┌─────────┐        │
//!                    │  │   DAG   │ │  Phase  │        │
//!                    │  │ Runner  │ │ Machine │        │
//!                    │  └─────────┘ └─────────┘        │
//!                    └─────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod agent;
pub mod batch;
pub mod bus;
pub mod dag;
pub mod judge;
pub mod ledger;
pub mod orchestrator;
pub mod phase;
pub mod responders;
pub mod state;
pub mod types;
pub mod voting;

pub mod observability;

pub use types::{AdventureConfig, Error, Result};
