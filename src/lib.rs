//! Host daemon for Prusa-style 3D printers on a serial G-code link.
//!
//! The [`serial::SerialQueue`] serializes every producer onto the link and
//! tracks each [`serial::Instruction`] to completion. Lines nobody claimed
//! go to the [`serial::OutputRouter`], whose observers feed the
//! [`state::StateManager`] and the [`telemetry::TelemetryStore`].
//! [`printer::Printer`] wires it all together.

pub mod config;
pub mod print_job;
pub mod printer;
pub mod probes;
pub mod serial;
pub mod shutdown;
pub mod state;
pub mod telemetry;
pub mod web;
