//! Typed attributes.
//!
//! An [`Attribute`] is a named, typed value exposed by a controller. Its
//! [`AccessMode`] decides which side may change it:
//!
//! - `Read`: the device publishes values through [`Attribute::update`].
//! - `Write`: clients demand values through [`Attribute::put`], which
//!   forwards them to the device.
//! - `ReadWrite`: both. The readback value and the demanded setpoint are
//!   tracked separately.
//!
//! Values are held in a `tokio::sync::watch` channel, so any number of
//! subscribers (transports, scans, tests) observe changes without polling.
//! Cloning an `Attribute` clones a handle; all clones share the same value,
//! metadata and listeners.
//!
//! # Example
//!
//! ```rust,ignore
//! let temperature = Attribute::read(DataType::float())
//!     .io_ref(TemperatureRef::new("T", UpdatePeriod::from_secs_f64(0.2)?))
//!     .description("Measured temperature")
//!     .build();
//!
//! let mut rx = temperature.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("T = {}", *rx.borrow());
//!     }
//! });
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;

use crate::attribute_io::DynAttributeIo;
use crate::datatype::{DataType, Value};
use crate::error::{FastCsError, Result};
use crate::io_ref::{AttributeIoRef, UpdatePeriod};
use crate::tracer::{Traced, Tracer};

/// Callback invoked after every value update.
pub type ChangeListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callback invoked after the datatype is replaced.
pub type DatatypeListener = Arc<dyn Fn(&DataType) + Send + Sync>;

/// Which side of the system may change an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Device-published value
    Read,
    /// Client-demanded value
    Write,
    /// Readback plus setpoint
    ReadWrite,
}

impl AccessMode {
    /// Whether the device side may publish values.
    pub fn can_update(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    /// Whether clients may put values.
    pub fn can_put(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AccessMode::Read => "R",
            AccessMode::Write => "W",
            AccessMode::ReadWrite => "RW",
        };
        write!(f, "{label}")
    }
}

struct AttributeMeta {
    name: String,
    /// Path of the owning controller
    path: Vec<String>,
    description: Option<String>,
    group: Option<String>,
    datatype: DataType,
}

struct AttributeInner {
    access: AccessMode,
    io_ref: Option<Arc<dyn AttributeIoRef>>,
    meta: RwLock<AttributeMeta>,
    value: watch::Sender<Value>,
    setpoint: Option<watch::Sender<Value>>,
    setpoint_seeded: AtomicBool,
    attached: AtomicBool,
    listeners: RwLock<Vec<ChangeListener>>,
    datatype_listeners: RwLock<Vec<DatatypeListener>>,
    io: OnceLock<Arc<dyn DynAttributeIo>>,
    tracer: Tracer,
}

/// Shared handle to a typed controller attribute.
#[derive(Clone)]
pub struct Attribute {
    inner: Arc<AttributeInner>,
}

/// Builder for [`Attribute`].
pub struct AttributeBuilder {
    access: AccessMode,
    datatype: DataType,
    io_ref: Option<Arc<dyn AttributeIoRef>>,
    description: Option<String>,
    group: Option<String>,
    initial: Option<Value>,
}

impl AttributeBuilder {
    /// Attach the IORef describing how to reach the device value.
    pub fn io_ref(mut self, io_ref: impl AttributeIoRef) -> Self {
        self.io_ref = Some(Arc::new(io_ref));
        self
    }

    /// Attach an already shared IORef.
    pub fn shared_io_ref(mut self, io_ref: Arc<dyn AttributeIoRef>) -> Self {
        self.io_ref = Some(io_ref);
        self
    }

    /// Human readable description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Display group used by UI generators.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Start from `value` instead of the datatype's initial value.
    ///
    /// # Errors
    ///
    /// `Validation` if the datatype rejects `value`.
    pub fn initial_value(mut self, value: impl Into<Value>) -> Result<Self> {
        self.initial = Some(self.datatype.validate(value.into())?);
        Ok(self)
    }

    /// Finish the attribute.
    pub fn build(self) -> Attribute {
        let initial = self
            .initial
            .unwrap_or_else(|| self.datatype.initial_value());
        let (value, _) = watch::channel(initial.clone());
        let setpoint = self.access.can_put().then(|| watch::channel(initial).0);

        Attribute {
            inner: Arc::new(AttributeInner {
                access: self.access,
                io_ref: self.io_ref,
                meta: RwLock::new(AttributeMeta {
                    name: String::new(),
                    path: Vec::new(),
                    description: self.description,
                    group: self.group,
                    datatype: self.datatype,
                }),
                value,
                setpoint,
                setpoint_seeded: AtomicBool::new(false),
                attached: AtomicBool::new(false),
                listeners: RwLock::new(Vec::new()),
                datatype_listeners: RwLock::new(Vec::new()),
                io: OnceLock::new(),
                tracer: Tracer::new("attribute"),
            }),
        }
    }
}

impl Attribute {
    /// Start building an attribute.
    pub fn builder(access: AccessMode, datatype: DataType) -> AttributeBuilder {
        AttributeBuilder {
            access,
            datatype,
            io_ref: None,
            description: None,
            group: None,
            initial: None,
        }
    }

    /// Read-only attribute.
    pub fn read(datatype: DataType) -> AttributeBuilder {
        Self::builder(AccessMode::Read, datatype)
    }

    /// Write-only attribute.
    pub fn write(datatype: DataType) -> AttributeBuilder {
        Self::builder(AccessMode::Write, datatype)
    }

    /// Read-write attribute.
    pub fn read_write(datatype: DataType) -> AttributeBuilder {
        Self::builder(AccessMode::ReadWrite, datatype)
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Name within the owning controller (empty until attached).
    pub fn name(&self) -> String {
        self.inner.meta.read().name.clone()
    }

    /// Dotted path from the root controller, e.g. `ramp.1.target`.
    pub fn full_name(&self) -> String {
        let meta = self.inner.meta.read();
        let mut segments = meta.path.clone();
        segments.push(meta.name.clone());
        segments.join(".")
    }

    /// Path of the owning controller.
    pub fn path(&self) -> Vec<String> {
        self.inner.meta.read().path.clone()
    }

    pub fn access_mode(&self) -> AccessMode {
        self.inner.access
    }

    /// Current datatype.
    pub fn datatype(&self) -> DataType {
        self.inner.meta.read().datatype.clone()
    }

    pub fn description(&self) -> Option<String> {
        self.inner.meta.read().description.clone()
    }

    pub fn group(&self) -> Option<String> {
        self.inner.meta.read().group.clone()
    }

    /// IORef describing how the device value is reached.
    pub fn io_ref(&self) -> Option<&Arc<dyn AttributeIoRef>> {
        self.inner.io_ref.as_ref()
    }

    /// Automatic refresh schedule of the IORef, if any.
    ///
    /// # Errors
    ///
    /// `Configuration` if the IORef holds an invalid period.
    pub fn update_period(&self) -> Result<Option<UpdatePeriod>> {
        match &self.inner.io_ref {
            Some(io_ref) => io_ref.update_period(),
            None => Ok(None),
        }
    }

    /// Whether an AttributeIo has been bound by the backend.
    pub fn is_bound(&self) -> bool {
        self.inner.io.get().is_some()
    }

    /// Whether two handles refer to the same attribute.
    pub fn ptr_eq(&self, other: &Attribute) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn attach(&self, name: &str, path: &[String]) -> Result<()> {
        if self.inner.attached.swap(true, Ordering::SeqCst) {
            return Err(FastCsError::Configuration(format!(
                "attribute '{}' is already owned by a controller",
                self.full_name()
            )));
        }
        let mut meta = self.inner.meta.write();
        meta.name = name.to_string();
        meta.path = path.to_vec();
        Ok(())
    }

    pub(crate) fn set_path(&self, path: &[String]) {
        self.inner.meta.write().path = path.to_vec();
    }

    pub(crate) fn bind_io(&self, io: Arc<dyn DynAttributeIo>) -> Result<()> {
        self.inner.io.set(io).map_err(|_| {
            FastCsError::Configuration(format!(
                "attribute '{}' is already bound to an AttributeIo",
                self.full_name()
            ))
        })
    }

    // =========================================================================
    // Values
    // =========================================================================

    /// Current value.
    pub fn get(&self) -> Value {
        self.inner.value.borrow().clone()
    }

    /// Last demanded value of a Write/ReadWrite attribute.
    pub fn setpoint(&self) -> Option<Value> {
        self.inner.setpoint.as_ref().map(|tx| tx.borrow().clone())
    }

    /// Publish a new value from the device side.
    ///
    /// Validates against the datatype, notifies subscribers and then calls
    /// change listeners in registration order. The first update of a
    /// ReadWrite attribute also seeds its setpoint.
    ///
    /// # Errors
    ///
    /// `AccessMode` for Write attributes, `Validation` if the datatype rejects
    /// the value. The stored value is unchanged on error.
    pub fn update(&self, value: impl Into<Value>) -> Result<()> {
        if !self.inner.access.can_update() {
            return Err(self.access_error("update"));
        }
        let value = self.datatype().validate(value.into())?;

        if let Some(setpoint) = &self.inner.setpoint {
            if !self.inner.setpoint_seeded.swap(true, Ordering::SeqCst) {
                setpoint.send_replace(value.clone());
            }
        }

        self.publish(value);
        Ok(())
    }

    /// Demand a new value from the client side.
    ///
    /// The value is validated before anything reaches the device. With a bound
    /// AttributeIo it is sent to the device; a ReadWrite attribute without an
    /// IORef applies it directly to its value. The setpoint always records
    /// the demand; `sync_setpoint` additionally notifies setpoint subscribers.
    ///
    /// # Errors
    ///
    /// `AccessMode` for Read attributes, `Validation` for rejected values,
    /// `Configuration` if the attribute has an IORef but no bound IO, or
    /// whatever the IO's `send` returns.
    pub async fn put(&self, value: impl Into<Value>, sync_setpoint: bool) -> Result<()> {
        if !self.inner.access.can_put() {
            return Err(self.access_error("put"));
        }
        let value = self.datatype().validate(value.into())?;

        match (&self.inner.io_ref, self.inner.io.get()) {
            (Some(io_ref), Some(io)) => {
                tracing::debug!(attribute = %self.full_name(), %value, "Sending put to device");
                io.send(self, io_ref.as_ref(), value.clone()).await?;
            }
            (Some(_), None) => {
                return Err(FastCsError::Configuration(format!(
                    "attribute '{}' has no bound AttributeIo",
                    self.full_name()
                )));
            }
            (None, _) => {}
        }

        if let Some(setpoint) = &self.inner.setpoint {
            setpoint.send_if_modified(|current| {
                *current = value.clone();
                sync_setpoint
            });
        }

        match self.inner.access {
            AccessMode::Write => self.publish(value.clone()),
            AccessMode::ReadWrite if self.inner.io_ref.is_none() => {
                self.inner.setpoint_seeded.store(true, Ordering::SeqCst);
                self.publish(value.clone());
            }
            _ => {}
        }
        self.log_event("Put complete", &[("setpoint", &value)]);
        Ok(())
    }

    /// Refresh the value from the device through the bound AttributeIo.
    ///
    /// # Errors
    ///
    /// `AccessMode` for Write attributes, `Configuration` if there is no
    /// IORef or no bound IO, or whatever the IO's `update` returns.
    pub async fn refresh(&self) -> Result<()> {
        if !self.inner.access.can_update() {
            return Err(self.access_error("update"));
        }
        let (Some(io_ref), Some(io)) = (&self.inner.io_ref, self.inner.io.get()) else {
            return Err(FastCsError::Configuration(format!(
                "attribute '{}' has no bound AttributeIo",
                self.full_name()
            )));
        };
        self.log_event("Update attribute", &[]);
        io.update(self, io_ref.as_ref()).await
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.inner.value.subscribe()
    }

    /// Subscribe to setpoint changes of a Write/ReadWrite attribute.
    pub fn subscribe_setpoint(&self) -> Option<watch::Receiver<Value>> {
        self.inner.setpoint.as_ref().map(|tx| tx.subscribe())
    }

    /// Register a callback run after every value update.
    pub fn add_change_listener(&self, listener: impl Fn(&Value) + Send + Sync + 'static) {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    /// Register a callback run after [`Attribute::update_datatype`].
    pub fn add_datatype_listener(&self, listener: impl Fn(&DataType) + Send + Sync + 'static) {
        self.inner.datatype_listeners.write().push(Arc::new(listener));
    }

    /// Wait until the value satisfies `predicate`, returning that value.
    ///
    /// # Errors
    ///
    /// `DeviceCommunication` if `timeout` elapses first.
    pub async fn wait_for_value(
        &self,
        mut predicate: impl FnMut(&Value) -> bool,
        timeout: Duration,
    ) -> Result<Value> {
        let mut rx = self.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|v| predicate(v))).await {
            Ok(Ok(value)) => Ok(value.clone()),
            // The sender lives as long as `self`, so the channel cannot close here.
            Ok(Err(_)) => Err(FastCsError::Disconnected(self.full_name())),
            Err(_) => Err(FastCsError::DeviceCommunication(format!(
                "timed out after {timeout:?} waiting for '{}'",
                self.full_name()
            ))),
        };
        result
    }

    /// Replace the datatype with another of the same kind.
    ///
    /// The current value is revalidated under the new datatype and reset to
    /// the new initial value if rejected.
    ///
    /// # Errors
    ///
    /// `Configuration` if the kind differs.
    pub fn update_datatype(&self, datatype: DataType) -> Result<()> {
        let current = self.datatype();
        if current.kind() != datatype.kind() {
            return Err(FastCsError::Configuration(format!(
                "cannot change datatype of '{}' from {} to {}",
                self.full_name(),
                current.kind(),
                datatype.kind()
            )));
        }
        self.inner.meta.write().datatype = datatype.clone();

        let value = datatype
            .validate(self.get())
            .unwrap_or_else(|_| datatype.initial_value());
        self.inner.value.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });

        let listeners = self.inner.datatype_listeners.read().clone();
        for listener in listeners {
            listener(&datatype);
        }
        Ok(())
    }

    fn publish(&self, value: Value) {
        self.log_event("Attribute set", &[("value", &value)]);
        self.inner.value.send_replace(value.clone());
        // Clone the list so listeners may register further listeners.
        let listeners = self.inner.listeners.read().clone();
        for listener in listeners {
            listener(&value);
        }
    }

    fn log_event(&self, event: &str, fields: &[(&str, &dyn fmt::Display)]) {
        if !self.inner.tracer.is_enabled() {
            return;
        }
        let name = self.full_name();
        let mut all: Vec<(&str, &dyn fmt::Display)> = Vec::with_capacity(fields.len() + 1);
        all.push(("attribute", &name));
        all.extend_from_slice(fields);
        self.inner.tracer.log_event(event, &all);
    }

    fn access_error(&self, operation: &'static str) -> FastCsError {
        FastCsError::AccessMode {
            attribute: self.full_name(),
            operation,
        }
    }
}

impl Traced for Attribute {
    fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.inner.meta.read();
        f.debug_struct("Attribute")
            .field("name", &meta.name)
            .field("access", &self.inner.access)
            .field("datatype", &meta.datatype.kind())
            .field("io_ref", &self.inner.io_ref)
            .finish()
    }
}
