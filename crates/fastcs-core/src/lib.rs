//! # fastcs-core
//!
//! Runtime core for control-system-agnostic device drivers.
//!
//! A driver is a tree of [`Controller`]s exposing typed [`Attribute`]s and
//! methods. Attributes that mirror device values carry an
//! [`AttributeIoRef`]; the [`AttributeIo`] registered for that reference type
//! performs the actual device exchange. The [`Backend`] takes the tree through
//! initialise, API snapshot, connect and start, then keeps periodic updates
//! and scans running until shutdown.
//!
//! ## Modules
//!
//! - [`datatype`]: value kinds, validation and the device wire grammar
//! - [`io_ref`] / [`attribute_io`]: per-attribute addressing and the handlers
//!   servicing it
//! - [`attribute`]: observable typed values with access modes
//! - [`controller`] / [`controller_vector`]: the controller tree
//! - [`methods`]: commands, put methods and scans
//! - [`controller_api`]: read-only snapshot used by transports
//! - [`backend`]: lifecycle and task scheduling
//! - [`transport`]: contract for protocol adapters
//! - [`connection`]: line-based device links (TCP, serial, any stream)
//! - [`tracer`]: per-instance trace logging for attributes and connections
//! - [`mock_device`]: scripted devices for tests

pub mod attribute;
pub mod attribute_io;
pub mod backend;
pub mod connection;
pub mod controller;
pub mod controller_api;
pub mod controller_vector;
pub mod datatype;
pub mod error;
pub mod io_ref;
pub mod methods;
pub mod mock_device;
mod scheduler;
pub mod tracer;
pub mod transport;

pub use attribute::{AccessMode, Attribute, AttributeBuilder};
pub use attribute_io::{AttributeIo, IoRegistry};
pub use backend::{Backend, BackendConfig, LifecycleState};
pub use connection::{Connection, IpConnection, IpConnectionSettings, StreamConnection};
pub use controller::{Controller, ControllerNode};
pub use controller_api::{ApiRequest, ApiResponse, ControllerApi};
pub use controller_vector::ControllerVector;
pub use datatype::{DataKind, DataType, EnumSpec, FloatSpec, NumericSpec, Value};
pub use error::{FastCsError, Result};
pub use io_ref::{AttributeIoRef, Period, UpdatePeriod};
pub use methods::{Command, Put, Scan};
pub use tracer::{Traced, Tracer};
pub use transport::{LoopHandoff, Transport};
