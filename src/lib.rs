//! Videonode - stream orchestration core for a single-host video node.
//!
//! Wires a capture device (C4) to an external encoder binary (C6/C7) and out
//! to RTP consumers (C8), all driven off the typed event bus (C1).

pub mod command;
pub mod device;
pub mod encoder;
pub mod error;
pub mod events;
pub mod hub;
pub mod led;
pub mod model;
pub mod ring;
pub mod store;
pub mod supervisor;
pub mod utils;
pub mod watcher;

pub use error::{AppError, Result};
