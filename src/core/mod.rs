//! Core module containing the session coordinator
//!
//! This module provides:
//! - Session state machine and the Notch service API
//! - Concurrent command fan-out with per-device failure aggregation
//! - Workout to device assignment
//! - Capture timer and cancellable operation handles
//! - Sequential data download
//! - Device link and discovery traits with an in-process simulator

pub mod capability;
pub mod cancellation;
pub mod descriptor;
pub mod device;
pub mod download;
pub mod error;
pub mod fanout;
pub mod registry;
pub mod service;
pub mod state_machine;
pub mod timer;
pub mod workout;
