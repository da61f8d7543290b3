//! Rust library for controlling AVPro Edge AC-MAX-24 and Xantech audio matrix amplifiers
//!
//! This library provides an async API for routing and level control of a
//! matrix amplifier over its local WebSocket interface. It supports:
//!
//! - A self-healing session with keep-alive and exponential-backoff reconnect
//! - A cached view of every input (source) and output (zone)
//! - Input routing, absolute and stepped volume, and mute per output
//! - Output grouping, with commands on a master repeated on its members
//! - Per-output snapshot and restore
//! - Change notifications through subscriptions or callbacks
//!
//! # Quick Start
//!
//! ```no_run
//! use acmax24::Matrix;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let matrix = Matrix::create("192.168.1.60")?;
//!     matrix.start().await?;
//!
//!     if !matrix.wait_for_initial_state(Duration::from_secs(5)).await {
//!         return Err("amplifier did not report its state".into());
//!     }
//!
//!     for zone in matrix.get_enabled_outputs() {
//!         println!("Output {}: {}", zone.index, zone.label);
//!     }
//!
//!     // Route input 2 to output 1 and turn it up a step
//!     matrix.change_input_for_output(1, 2).await?;
//!     matrix.step_output_volume(1, 5).await?;
//!
//!     // Watch for changes made elsewhere
//!     let mut changes = matrix.subscribe();
//!     while let Some(change) = changes.recv().await {
//!         println!("Change: {:?}", change);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Matrix**: Public handle tying the layers together
//! - **Dispatcher**: Validation and per-output command serialization
//! - **Session**: Link supervision, keep-alive and reconnect
//! - **Connection**: Low-level WebSocket request/response handling
//! - **Cache**: Single-writer store of input and output state
//! - **Subscription**: Fan-out of change events to observers
//! - **Protocol**: JSON message structures

mod cache;
mod config;
mod connection;
mod dispatcher;
mod error;
mod matrix;
mod protocol;
mod session;
mod subscription;
mod types;

// Public exports
pub use cache::{SourceDirectory, StateCache};
pub use config::MatrixConfig;
pub use error::{MatrixError, Result};
pub use matrix::Matrix;
pub use subscription::{ChangeBus, ChangeEvent, NotifierHandle, Subscription};
pub use types::{
    ConnectionState, Endpoint, GroupState, InputIndex, OutputIndex, Source, Zone, ZoneField,
    ZoneSnapshot, ZoneValue, MAX_VOLUME,
};
