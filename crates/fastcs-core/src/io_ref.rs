//! Attribute IO references and update scheduling.
//!
//! An [`AttributeIoRef`] is the static, per-attribute description of *how* to
//! reach the device value (a register name, a command prefix, ...). It is pure
//! data; the behaviour lives in the matching
//! [`AttributeIo`](crate::attribute_io::AttributeIo), which is selected by the
//! concrete Rust type of the reference.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::{FastCsError, Result};

/// Refresh interval of a periodic update, always greater than zero.
///
/// The only constructors validate, so a zero interval never reaches the
/// scheduler. Deserializes from a `Duration` through the same check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Duration", into = "Duration")]
pub struct Period(Duration);

impl Period {
    /// # Errors
    ///
    /// `Configuration` for a zero duration.
    pub fn new(period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(FastCsError::Configuration(
                "update period must be greater than zero".into(),
            ));
        }
        Ok(Self(period))
    }

    /// # Errors
    ///
    /// `Configuration` for zero, negative and non-finite values.
    pub fn from_secs_f64(secs: f64) -> Result<Self> {
        if !secs.is_finite() || secs <= 0.0 {
            return Err(FastCsError::Configuration(format!(
                "invalid update period {secs}s"
            )));
        }
        Duration::try_from_secs_f64(secs)
            .map_err(|e| FastCsError::Configuration(format!("invalid update period {secs}s: {e}")))
            .and_then(Self::new)
    }

    /// Interval as a `Duration`.
    pub fn get(self) -> Duration {
        self.0
    }
}

impl TryFrom<Duration> for Period {
    type Error = FastCsError;

    fn try_from(period: Duration) -> Result<Self> {
        Self::new(period)
    }
}

impl From<Period> for Duration {
    fn from(period: Period) -> Self {
        period.0
    }
}

/// How often the backend refreshes an attribute from its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdatePeriod {
    /// Refresh exactly once, right after the connect phase.
    Once,
    /// Refresh periodically, first firing immediately.
    Every(Period),
}

impl UpdatePeriod {
    /// Periodic refresh. Zero periods are rejected.
    pub fn every(period: Duration) -> Result<Self> {
        Period::new(period).map(UpdatePeriod::Every)
    }

    /// Periodic refresh from seconds. Zero, negative and non-finite values are
    /// rejected.
    pub fn from_secs_f64(secs: f64) -> Result<Self> {
        Period::from_secs_f64(secs).map(UpdatePeriod::Every)
    }

    /// Period of a periodic refresh, `None` for [`UpdatePeriod::Once`].
    pub fn period(&self) -> Option<Duration> {
        match self {
            UpdatePeriod::Once => None,
            UpdatePeriod::Every(period) => Some(period.get()),
        }
    }
}

/// Per-attribute addressing data for an [`AttributeIo`](crate::attribute_io::AttributeIo).
///
/// Implementors are plain data types. The IO registered for the reference's
/// concrete type is looked up at startup, so two reference types never share
/// an IO by accident.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Debug)]
/// struct RegisterRef {
///     register: String,
///     period_secs: Option<f64>,
/// }
///
/// impl AttributeIoRef for RegisterRef {
///     fn update_period(&self) -> Result<Option<UpdatePeriod>> {
///         self.period_secs.map(UpdatePeriod::from_secs_f64).transpose()
///     }
///
///     fn as_any(&self) -> &dyn Any {
///         self
///     }
/// }
/// ```
pub trait AttributeIoRef: Debug + Send + Sync + 'static {
    /// Automatic refresh schedule. `None` means manual refresh only.
    ///
    /// # Errors
    ///
    /// `Configuration` if the reference was given an invalid period. The
    /// backend collects these when it initialises the tree.
    fn update_period(&self) -> Result<Option<UpdatePeriod>> {
        Ok(None)
    }

    /// Get a reference to this IORef as `&dyn Any` for downcasting
    fn as_any(&self) -> &dyn Any;
}
