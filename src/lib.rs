//! # FastCS
//!
//! Application layer over [`fastcs_core`]. The core crate holds the controller
//! tree, attributes and the lifecycle backend; this crate adds what a runnable
//! driver needs around it.
//!
//! ## Crate Structure
//!
//! - **`config`**: `LaunchConfig`, loaded from TOML plus `FASTCS_` environment
//!   overrides and validated before use.
//! - **`logging`**: tracing subscriber setup (pretty, compact or JSON output).
//! - **`demo`**: a temperature ramp controller driving a TCP device, and a
//!   simulator of that device in `demo::simulation`.

pub mod config;
pub mod demo;
pub mod logging;
