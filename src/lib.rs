//! # CubeSat Command & Telemetry Subsystem
//!
//! Flight software for the on-board computer of a 1U CubeSat: periodic
//! sensor acquisition into fixed-size telemetry snapshots, a pulse-counting
//! radiation rate, a checksummed binary link to the companion computer and
//! the radio, ground command execution, and a watchdog unit that enforces
//! battery and temperature safety limits.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cubesat_obc::{FlightConfig, FlightSoftware, SimulatedBoard};
//!
//! # async fn boot() -> Result<(), cubesat_obc::ObcError> {
//! let board = SimulatedBoard::default();
//! let mut flight = FlightSoftware::spawn(&FlightConfig::default(), board.board())?;
//!
//! // Bytes arriving on the companion UART
//! let report = flight.ingress().on_bytes(&[0xAA, 0x55, 0x02]);
//! println!("{report:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - wire types, frame layouts and the state/flag enums
//! - [`framing`] - resynchronising byte-stream decoder
//! - [`coordinator`] - the four periodic units and their shared state
//! - [`dispatch`] - ground command execution
//! - [`safety`] - battery and temperature limits with hysteresis
//! - [`hal`] - board collaborator traits
//! - [`sim`] - host implementation of every collaborator

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod events;
pub mod framing;
pub mod hal;
pub mod health;
pub mod protocol;
pub mod queue;
pub mod safety;
pub mod sim;
pub mod state;
pub mod telemetry;

// Re-export main public types for convenience
pub use config::FlightConfig;
pub use coordinator::{Board, FlightSoftware, ObcError, SharedState};
pub use protocol::{Beacon, CommandId, CommandPacket, SystemState, TelemetryPacket};
pub use sim::SimulatedBoard;
