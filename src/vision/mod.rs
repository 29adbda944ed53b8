//! Camera side: frame acquisition seams and the vision producer thread.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

pub mod detector;
pub mod tracker;
