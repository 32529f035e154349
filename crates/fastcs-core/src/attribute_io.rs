//! Attribute IO handlers.
//!
//! An [`AttributeIo`] implements the device interaction for every attribute
//! whose IORef has the handler's [`AttributeIo::Ref`] type: `update` pulls a
//! fresh value from the device into the attribute, `send` pushes a put value
//! out to the device.
//!
//! Handlers are registered per controller in an [`IoRegistry`]. At startup the
//! backend binds every attribute to the handler found on its owning controller
//! or the nearest ancestor that has one for the reference type.

use async_trait::async_trait;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::attribute::Attribute;
use crate::datatype::{DataKind, Value};
use crate::error::{FastCsError, Result};
use crate::io_ref::AttributeIoRef;

/// Device interaction for attributes referencing `Self::Ref`.
///
/// # Example
///
/// ```rust,ignore
/// struct RegisterIo {
///     connection: Arc<dyn Connection>,
/// }
///
/// #[async_trait]
/// impl AttributeIo for RegisterIo {
///     type Ref = RegisterRef;
///
///     async fn update(&self, attr: &Attribute, io_ref: &RegisterRef) -> Result<()> {
///         let response = self.connection.send_query(&format!("{}?\r\n", io_ref.register)).await?;
///         attr.update(attr.datatype().parse_wire(&response)?)
///     }
///
///     async fn send(&self, attr: &Attribute, io_ref: &RegisterRef, value: Value) -> Result<()> {
///         let text = attr.datatype().format_wire(&value)?;
///         self.connection.send_command(&format!("{}={}\r\n", io_ref.register, text)).await
///     }
/// }
/// ```
#[async_trait]
pub trait AttributeIo: Send + Sync + 'static {
    /// IORef type this handler services.
    type Ref: AttributeIoRef;

    /// Whether this handler can service attributes of the given kind.
    fn supports(&self, _kind: DataKind) -> bool {
        true
    }

    /// Read the device value and publish it with [`Attribute::update`].
    async fn update(&self, attr: &Attribute, _io_ref: &Self::Ref) -> Result<()> {
        Err(FastCsError::Configuration(format!(
            "{} does not implement update for '{}'",
            type_name::<Self>(),
            attr.full_name()
        )))
    }

    /// Write a validated put value to the device.
    async fn send(&self, attr: &Attribute, _io_ref: &Self::Ref, _value: Value) -> Result<()> {
        Err(FastCsError::Configuration(format!(
            "{} does not implement send for '{}'",
            type_name::<Self>(),
            attr.full_name()
        )))
    }
}

/// Type-erased [`AttributeIo`] stored in registries and bound attributes.
#[async_trait]
pub trait DynAttributeIo: Send + Sync {
    /// `TypeId` of the serviced IORef type
    fn ref_type(&self) -> TypeId;

    /// Name of the serviced IORef type, for diagnostics
    fn ref_type_name(&self) -> &'static str;

    fn supports(&self, kind: DataKind) -> bool;

    async fn update(&self, attr: &Attribute, io_ref: &dyn AttributeIoRef) -> Result<()>;

    async fn send(&self, attr: &Attribute, io_ref: &dyn AttributeIoRef, value: Value)
        -> Result<()>;
}

struct ErasedIo<I>(I);

impl<I: AttributeIo> ErasedIo<I> {
    fn downcast<'a>(&self, io_ref: &'a dyn AttributeIoRef) -> Result<&'a I::Ref> {
        io_ref.as_any().downcast_ref::<I::Ref>().ok_or_else(|| {
            FastCsError::Configuration(format!(
                "IORef {io_ref:?} is not a {}",
                type_name::<I::Ref>()
            ))
        })
    }
}

#[async_trait]
impl<I: AttributeIo> DynAttributeIo for ErasedIo<I> {
    fn ref_type(&self) -> TypeId {
        TypeId::of::<I::Ref>()
    }

    fn ref_type_name(&self) -> &'static str {
        type_name::<I::Ref>()
    }

    fn supports(&self, kind: DataKind) -> bool {
        self.0.supports(kind)
    }

    async fn update(&self, attr: &Attribute, io_ref: &dyn AttributeIoRef) -> Result<()> {
        let io_ref = self.downcast(io_ref)?;
        self.0.update(attr, io_ref).await
    }

    async fn send(
        &self,
        attr: &Attribute,
        io_ref: &dyn AttributeIoRef,
        value: Value,
    ) -> Result<()> {
        let io_ref = self.downcast(io_ref)?;
        self.0.send(attr, io_ref, value).await
    }
}

/// Attribute IO handlers registered on one controller, keyed by IORef type.
#[derive(Clone, Default)]
pub struct IoRegistry {
    ios: HashMap<TypeId, Arc<dyn DynAttributeIo>>,
}

impl IoRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    ///
    /// # Errors
    ///
    /// `Configuration` if a handler for the same IORef type is already
    /// registered, since resolution would be ambiguous.
    pub fn register<I: AttributeIo>(&mut self, io: I) -> Result<()> {
        self.register_arc(Arc::new(ErasedIo(io)))
    }

    /// Register an already shared handler.
    pub fn register_arc(&mut self, io: Arc<dyn DynAttributeIo>) -> Result<()> {
        let ref_type = io.ref_type();
        if self.ios.contains_key(&ref_type) {
            return Err(FastCsError::Configuration(format!(
                "more than one AttributeIo registered for {}",
                io.ref_type_name()
            )));
        }
        self.ios.insert(ref_type, io);
        Ok(())
    }

    /// Handler for the concrete type of `io_ref`.
    pub fn lookup(&self, io_ref: &dyn AttributeIoRef) -> Option<Arc<dyn DynAttributeIo>> {
        self.ios.get(&io_ref.as_any().type_id()).cloned()
    }

    /// Number of registered IOs.
    pub fn len(&self) -> usize {
        self.ios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ios.is_empty()
    }
}

impl std::fmt::Debug for IoRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.ios.values().map(|io| io.ref_type_name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    #[derive(Debug)]
    struct RefA;
    impl AttributeIoRef for RefA {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct RefB;
    impl AttributeIoRef for RefB {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct IoA;
    #[async_trait]
    impl AttributeIo for IoA {
        type Ref = RefA;
    }

    struct OtherIoA;
    #[async_trait]
    impl AttributeIo for OtherIoA {
        type Ref = RefA;

        fn supports(&self, kind: DataKind) -> bool {
            kind == DataKind::Float
        }
    }

    #[test]
    fn duplicate_ref_type_is_ambiguous() {
        let mut registry = IoRegistry::new();
        registry.register(IoA).unwrap();
        let err = registry.register(OtherIoA).unwrap_err();
        assert!(matches!(err, FastCsError::Configuration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_by_concrete_ref_type() {
        let mut registry = IoRegistry::new();
        registry.register(OtherIoA).unwrap();

        let found = registry.lookup(&RefA).unwrap();
        assert!(found.supports(DataKind::Float));
        assert!(!found.supports(DataKind::Int));
        assert!(registry.lookup(&RefB).is_none());
    }
}
