//! Controller methods: commands, puts and scans.
//!
//! Methods are async closures stored on a controller and exposed through the
//! [`ControllerApi`](crate::controller_api::ControllerApi):
//!
//! - [`Command`]: no argument, invoked by an external trigger.
//! - [`Put`]: one validated [`Value`] argument.
//! - [`Scan`]: invoked by the backend on a fixed period.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::datatype::{DataType, Value};
use crate::error::{FastCsError, Result};
use crate::io_ref::Period;

type MethodFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;
type PutFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Controller operation with no argument.
#[derive(Clone)]
pub struct Command {
    func: MethodFn,
    description: Option<String>,
    group: Option<String>,
}

impl Command {
    /// Command running `func` on each call.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            func: Arc::new(move || Box::pin(func())),
            description: None,
            group: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Display group used by UI generators.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub async fn call(&self) -> Result<()> {
        (self.func)().await
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Controller operation taking one value of a fixed datatype.
#[derive(Clone)]
pub struct Put {
    func: PutFn,
    datatype: DataType,
    description: Option<String>,
}

impl Put {
    /// Put method validating its argument against `datatype` before calling `func`.
    pub fn new<F, Fut>(datatype: DataType, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |value| Box::pin(func(value))),
            datatype,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Datatype arguments are validated against.
    pub fn datatype(&self) -> &DataType {
        &self.datatype
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Validate `value` against the datatype and invoke the method.
    pub async fn call(&self, value: impl Into<Value>) -> Result<()> {
        let value = self.datatype.validate(value.into())?;
        (self.func)(value).await
    }
}

impl fmt::Debug for Put {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Put")
            .field("datatype", &self.datatype.kind())
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Controller operation the backend runs periodically.
#[derive(Clone)]
pub struct Scan {
    func: MethodFn,
    period: Period,
}

impl Scan {
    /// # Errors
    ///
    /// `Configuration` for a zero period.
    pub fn new<F, Fut>(period: Duration, func: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let period = Period::new(period).map_err(|_| {
            FastCsError::Configuration("scan period must be greater than zero".into())
        })?;
        Ok(Self {
            func: Arc::new(move || Box::pin(func())),
            period,
        })
    }

    /// # Errors
    ///
    /// `Configuration` for zero, negative or non-finite periods.
    pub fn from_secs_f64<F, Fut>(secs: f64, func: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if !secs.is_finite() || secs <= 0.0 {
            return Err(FastCsError::Configuration(format!(
                "invalid scan period {secs}s"
            )));
        }
        let period = Duration::try_from_secs_f64(secs)
            .map_err(|e| FastCsError::Configuration(format!("invalid scan period {secs}s: {e}")))?;
        Self::new(period, func)
    }

    /// Interval between calls.
    pub fn period(&self) -> Duration {
        self.period.get()
    }

    pub(crate) fn schedule(&self) -> Period {
        self.period
    }

    pub async fn call(&self) -> Result<()> {
        (self.func)().await
    }
}

impl fmt::Debug for Scan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scan")
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}
