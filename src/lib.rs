//! Host controller for the Schrödinger's Cat dispenser installation.
//!
//! Three workers share one snapshot store: the vision producer publishes
//! face snapshots, the state machine turns them into actuator commands at a
//! fixed tick rate, and the serial worker carries commands and telemetry
//! over the UART to the enclosure MCU. The operator dashboard (external)
//! reads the store and drives the state machine through its operator handle.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

pub mod comm;
pub mod config;
pub mod logic;
pub mod state;
pub mod vision;
