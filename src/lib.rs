//! # Bottling Line Digital Twin
//!
//! A deterministic, schedule-driven simulation of a single industrial
//! bottling line. The line's instantaneous state is exposed as Modbus TCP
//! holding registers for any polling client, and every order, state change,
//! stop and fault is appended as a governed transaction record to a
//! newline-delimited JSON log.
//!
//! ## Architecture
//!
//! - [`clock`]: virtual time behind a speed factor; tests use a manual clock
//! - [`registers`]: the documented holding register map, staging image and
//!   snapshot bank
//! - [`server`]: minimal Modbus TCP (FC03) over tokio
//! - [`events`]: ULID-stamped transaction records through a bounded queue
//! - [`sku`] / [`schedule`]: master data and the production week
//! - [`microstops`] / [`breakdowns`]: the stochastic interruption libraries
//! - [`state`]: the line state machine with precedence arbitration
//! - [`line`]: the tick loop that owns all simulation state
//! - [`config`]: YAML tunables and CLI overrides
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use linesim::clock::SimClock;
//! use linesim::config::Config;
//! use linesim::events::EventEmitter;
//! use linesim::line::LineSimulator;
//! use linesim::registers::RegisterBank;
//! use linesim::schedule;
//!
//! let cfg = Config::default();
//! let bank = Arc::new(RegisterBank::new());
//! let emitter = EventEmitter::new(
//!     std::path::Path::new("logs/transactions.jsonl"),
//!     cfg.hierarchy(),
//!     true,
//! ).unwrap();
//! let clock = Arc::new(SimClock::new(cfg.simulator.speed_factor));
//! let mut sim = LineSimulator::new(
//!     cfg.sim_settings(),
//!     schedule::built_in_week(),
//!     clock,
//!     bank,
//!     emitter,
//! );
//! sim.run(&AtomicBool::new(false)).unwrap();
//! ```

pub mod breakdowns;
pub mod clock;
pub mod config;
pub mod events;
pub mod line;
pub mod microstops;
pub mod registers;
pub mod schedule;
pub mod server;
pub mod sku;
pub mod state;

pub use clock::{Clock, ManualClock, SimClock};
pub use events::{EventEmitter, EventPayload};
pub use line::{LineSimulator, SimSettings};
pub use registers::RegisterBank;
pub use state::{LineState, StopCode};
