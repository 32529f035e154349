//! Controllers and the controller tree.
//!
//! A [`Controller`] owns a [`ControllerNode`] holding its members: attributes,
//! sub-controllers, methods and the attribute IOs it registers. Controllers
//! form a tree rooted at the controller handed to the
//! [`Backend`](crate::backend::Backend).
//!
//! # Lifecycle hooks
//!
//! | Hook         | When                                  | Typical use                      |
//! |--------------|---------------------------------------|----------------------------------|
//! | `initialise` | before the API snapshot, pre-order    | introspect device, add members   |
//! | `connect`    | after the API snapshot, pre-order     | open the device connection       |
//! | `disconnect` | during shutdown, post-order           | close the device connection      |
//!
//! The tree may be changed freely until the backend seals it. After that
//! every structural change fails with [`FastCsError::Sealed`].
//!
//! # Example
//!
//! ```rust,ignore
//! struct PowerSupply {
//!     node: ControllerNode,
//! }
//!
//! #[async_trait]
//! impl Controller for PowerSupply {
//!     fn node(&self) -> &ControllerNode {
//!         &self.node
//!     }
//!
//!     async fn initialise(&self) -> Result<()> {
//!         self.node.add_attribute("voltage", Attribute::read(DataType::float()).build())
//!     }
//! }
//! ```

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::attribute::{AccessMode, Attribute};
use crate::attribute_io::{AttributeIo, DynAttributeIo, IoRegistry};
use crate::datatype::DataKind;
use crate::error::{FastCsError, Result};
use crate::methods::{Command, Put, Scan};

/// A node of the controller tree with lifecycle hooks.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Members and tree position of this controller.
    fn node(&self) -> &ControllerNode;

    /// Introspect the device and create dynamic members.
    async fn initialise(&self) -> Result<()> {
        Ok(())
    }

    /// Establish the device connection.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Release the device connection during shutdown.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Member a controller promises to create during `initialise`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeHint {
    /// Attribute name
    pub name: String,
    /// Required access mode
    pub access: AccessMode,
    /// Required value kind
    pub kind: DataKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Named,
    Vector,
}

struct NodeState {
    path: Vec<String>,
    description: Option<String>,
    attributes: IndexMap<String, Attribute>,
    sub_controllers: IndexMap<String, Arc<dyn Controller>>,
    commands: IndexMap<String, Command>,
    puts: IndexMap<String, Put>,
    scans: IndexMap<String, Scan>,
    ios: IoRegistry,
    attribute_hints: Vec<AttributeHint>,
    sub_controller_hints: Vec<String>,
}

impl NodeState {
    fn ensure_free(&self, name: &str) -> Result<()> {
        let taken = self.attributes.contains_key(name)
            || self.sub_controllers.contains_key(name)
            || self.commands.contains_key(name)
            || self.puts.contains_key(name)
            || self.scans.contains_key(name);
        if taken {
            return Err(FastCsError::Configuration(format!(
                "'{}' already has a member named '{name}'",
                display_path(&self.path)
            )));
        }
        Ok(())
    }
}

/// Members and tree position of a controller.
pub struct ControllerNode {
    kind: NodeKind,
    state: RwLock<NodeState>,
    has_parent: AtomicBool,
    sealed: AtomicBool,
}

impl Default for ControllerNode {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerNode {
    /// Empty, unattached controller node.
    pub fn new() -> Self {
        Self::with_kind(NodeKind::Named)
    }

    pub(crate) fn with_kind(kind: NodeKind) -> Self {
        Self {
            kind,
            state: RwLock::new(NodeState {
                path: Vec::new(),
                description: None,
                attributes: IndexMap::new(),
                sub_controllers: IndexMap::new(),
                commands: IndexMap::new(),
                puts: IndexMap::new(),
                scans: IndexMap::new(),
                ios: IoRegistry::new(),
                attribute_hints: Vec::new(),
                sub_controller_hints: Vec::new(),
            }),
            has_parent: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
        }
    }

    /// Human readable description for transports and UIs.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.state.write().description = Some(description.into());
        self
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Add an attribute under `name`.
    ///
    /// # Errors
    ///
    /// `Sealed` after the API snapshot, `Configuration` for invalid or taken
    /// names and attributes already owned by another controller.
    pub fn add_attribute(&self, name: &str, attribute: Attribute) -> Result<()> {
        let mut state = self.writable("add an attribute")?;
        validate_member_name(name)?;
        state.ensure_free(name)?;
        attribute.attach(name, &state.path)?;
        state.attributes.insert(name.to_string(), attribute);
        Ok(())
    }

    /// Add a named sub-controller.
    ///
    /// # Errors
    ///
    /// `Sealed` after the API snapshot; `Configuration` for invalid or taken
    /// names, on controller vectors (which only take indexed children), for
    /// controllers that already have a parent and for cycles.
    pub fn add_sub_controller(&self, name: &str, controller: Arc<dyn Controller>) -> Result<()> {
        if self.kind == NodeKind::Vector {
            return Err(FastCsError::Configuration(format!(
                "'{}' is a controller vector, children are added by index",
                self.display_path()
            )));
        }
        validate_member_name(name)?;
        self.attach_child(name.to_string(), controller)
    }

    pub(crate) fn insert_indexed(&self, index: usize, controller: Arc<dyn Controller>) -> Result<()> {
        self.attach_child(index.to_string(), controller)?;
        self.state
            .write()
            .sub_controllers
            .sort_by(|a, _, b, _| index_key(a).cmp(&index_key(b)));
        Ok(())
    }

    fn attach_child(&self, name: String, controller: Arc<dyn Controller>) -> Result<()> {
        if self.is_sealed() {
            return Err(FastCsError::Sealed("add a sub-controller".into()));
        }
        let child = controller.node();
        if std::ptr::eq(child, self) || subtree_contains(&controller, self) {
            return Err(FastCsError::Configuration(format!(
                "adding '{name}' to '{}' would create a cycle",
                self.display_path()
            )));
        }

        let child_path = {
            let mut state = self.writable("add a sub-controller")?;
            state.ensure_free(&name)?;
            if child.has_parent.swap(true, Ordering::SeqCst) {
                return Err(FastCsError::Configuration(format!(
                    "controller '{name}' already has a parent"
                )));
            }
            let mut path = state.path.clone();
            path.push(name.clone());
            state.sub_controllers.insert(name, controller.clone());
            path
        };
        child.set_path(child_path);
        Ok(())
    }

    /// Add a command under `name`. Fails like [`ControllerNode::add_attribute`].
    pub fn add_command(&self, name: &str, command: Command) -> Result<()> {
        let mut state = self.writable("add a command")?;
        validate_member_name(name)?;
        state.ensure_free(name)?;
        state.commands.insert(name.to_string(), command);
        Ok(())
    }

    /// Add a put method under `name`. Fails like [`ControllerNode::add_attribute`].
    pub fn add_put(&self, name: &str, put: Put) -> Result<()> {
        let mut state = self.writable("add a put method")?;
        validate_member_name(name)?;
        state.ensure_free(name)?;
        state.puts.insert(name.to_string(), put);
        Ok(())
    }

    /// Add a scan under `name`, run on its period once the backend starts.
    /// Fails like [`ControllerNode::add_attribute`].
    ///
    /// ```
    /// # use fastcs_core::{ControllerNode, Scan};
    /// # use std::time::Duration;
    /// let node = ControllerNode::new();
    /// let scan = Scan::new(Duration::from_millis(100), || async { Ok(()) })?;
    /// node.add_scan("poll", scan)?;
    /// assert_eq!(node.scans()[0].0, "poll");
    /// # Ok::<(), fastcs_core::FastCsError>(())
    /// ```
    pub fn add_scan(&self, name: &str, scan: Scan) -> Result<()> {
        let mut state = self.writable("add a scan method")?;
        validate_member_name(name)?;
        state.ensure_free(name)?;
        state.scans.insert(name.to_string(), scan);
        Ok(())
    }

    /// Register an attribute IO for attributes of this subtree.
    ///
    /// # Errors
    ///
    /// `Configuration` if an IO for the same IORef type is already registered
    /// on this controller.
    pub fn add_io<I: AttributeIo>(&self, io: I) -> Result<()> {
        self.writable("register an attribute IO")?.ios.register(io)
    }

    /// Register an IO shared with other controllers.
    pub fn add_shared_io(&self, io: Arc<dyn DynAttributeIo>) -> Result<()> {
        self.writable("register an attribute IO")?.ios.register_arc(io)
    }

    /// Promise an attribute that `initialise` will create.
    pub fn declare_attribute(&self, name: &str, access: AccessMode, kind: DataKind) -> Result<()> {
        let mut state = self.writable("declare an attribute")?;
        validate_member_name(name)?;
        state.attribute_hints.push(AttributeHint {
            name: name.to_string(),
            access,
            kind,
        });
        Ok(())
    }

    /// Promise a sub-controller that `initialise` will create.
    pub fn declare_sub_controller(&self, name: &str) -> Result<()> {
        let mut state = self.writable("declare a sub-controller")?;
        state.sub_controller_hints.push(name.to_string());
        Ok(())
    }

    fn writable(&self, operation: &str) -> Result<parking_lot::RwLockWriteGuard<'_, NodeState>> {
        if self.is_sealed() {
            return Err(FastCsError::Sealed(operation.to_string()));
        }
        Ok(self.state.write())
    }

    fn set_path(&self, path: Vec<String>) {
        let children: Vec<(String, Arc<dyn Controller>)> = {
            let mut state = self.state.write();
            for attribute in state.attributes.values() {
                attribute.set_path(&path);
            }
            state.path = path.clone();
            state
                .sub_controllers
                .iter()
                .map(|(name, c)| (name.clone(), c.clone()))
                .collect()
        };
        for (name, child) in children {
            let mut child_path = path.clone();
            child_path.push(name);
            child.node().set_path(child_path);
        }
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether the API snapshot has been taken and membership is frozen.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Path segments from the root (empty for the root).
    pub fn path(&self) -> Vec<String> {
        self.state.read().path.clone()
    }

    /// Dotted path, `<root>` for the root controller.
    pub fn display_path(&self) -> String {
        display_path(&self.state.read().path)
    }

    pub fn description(&self) -> Option<String> {
        self.state.read().description.clone()
    }

    /// Attribute named `name` on this controller.
    pub fn attribute(&self, name: &str) -> Option<Attribute> {
        self.state.read().attributes.get(name).cloned()
    }

    /// Attributes in declaration order.
    pub fn attributes(&self) -> Vec<(String, Attribute)> {
        clone_entries(&self.state.read().attributes)
    }

    /// Direct child named `name` (the index as text for vectors).
    pub fn sub_controller(&self, name: &str) -> Option<Arc<dyn Controller>> {
        self.state.read().sub_controllers.get(name).cloned()
    }

    /// Sub-controllers in declaration order (ascending index for vectors).
    pub fn sub_controllers(&self) -> Vec<(String, Arc<dyn Controller>)> {
        clone_entries(&self.state.read().sub_controllers)
    }

    /// Commands in declaration order.
    pub fn commands(&self) -> Vec<(String, Command)> {
        clone_entries(&self.state.read().commands)
    }

    /// Put methods in declaration order.
    pub fn puts(&self) -> Vec<(String, Put)> {
        clone_entries(&self.state.read().puts)
    }

    /// Scans in declaration order.
    pub fn scans(&self) -> Vec<(String, Scan)> {
        clone_entries(&self.state.read().scans)
    }

    /// IOs registered on this controller.
    pub fn ios(&self) -> IoRegistry {
        self.state.read().ios.clone()
    }

    /// Check that every declared member was created with the declared shape.
    pub(crate) fn validate_hints(&self) -> Result<()> {
        let state = self.state.read();
        let mut problems = Vec::new();
        for hint in &state.attribute_hints {
            match state.attributes.get(&hint.name) {
                None => problems.push(format!("missing attribute '{}'", hint.name)),
                Some(attr) => {
                    if attr.access_mode() != hint.access {
                        problems.push(format!(
                            "attribute '{}' is {} but was declared {}",
                            hint.name,
                            attr.access_mode(),
                            hint.access
                        ));
                    }
                    let kind = attr.datatype().kind();
                    if kind != hint.kind {
                        problems.push(format!(
                            "attribute '{}' is {kind} but was declared {}",
                            hint.name, hint.kind
                        ));
                    }
                }
            }
        }
        for name in &state.sub_controller_hints {
            if !state.sub_controllers.contains_key(name) {
                problems.push(format!("missing sub-controller '{name}'"));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(FastCsError::Configuration(format!(
                "'{}' does not match its declaration: {}",
                display_path(&state.path),
                problems.join("; ")
            )))
        }
    }
}

impl fmt::Debug for ControllerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ControllerNode")
            .field("path", &state.path)
            .field("attributes", &state.attributes.keys().collect::<Vec<_>>())
            .field("sub_controllers", &state.sub_controllers.keys().collect::<Vec<_>>())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

/// A bare node is a controller without hooks.
#[async_trait]
impl Controller for ControllerNode {
    fn node(&self) -> &ControllerNode {
        self
    }
}

// =============================================================================
// Tree traversal
// =============================================================================

/// Pre-order snapshot of the tree below (and including) `root`.
pub fn walk_tree(root: &Arc<dyn Controller>) -> Vec<Arc<dyn Controller>> {
    let mut out = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(controller) = stack.pop() {
        let children = controller.node().sub_controllers();
        stack.extend(children.into_iter().rev().map(|(_, c)| c));
        out.push(controller);
    }
    out
}

/// Post-order snapshot: every controller after all of its descendants.
pub fn post_order(root: &Arc<dyn Controller>) -> Vec<Arc<dyn Controller>> {
    let mut out = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(controller) = stack.pop() {
        let children = controller.node().sub_controllers();
        stack.extend(children.into_iter().map(|(_, c)| c));
        out.push(controller);
    }
    out.reverse();
    out
}

fn subtree_contains(root: &Arc<dyn Controller>, target: &ControllerNode) -> bool {
    walk_tree(root)
        .iter()
        .any(|c| std::ptr::eq(c.node(), target))
}

/// Bind every attribute with an IORef to its AttributeIo.
///
/// Resolution looks at the owning controller's registry, then at each
/// ancestor in turn. Update periods are checked on the same pass, and all
/// failures are reported together.
pub(crate) fn bind_attribute_ios(root: &Arc<dyn Controller>) -> Result<usize> {
    let mut unresolved = Vec::new();
    let mut bad_periods = Vec::new();
    let mut bound = 0;
    let mut stack: Vec<(Arc<dyn Controller>, Vec<IoRegistry>)> = vec![(root.clone(), Vec::new())];

    while let Some((controller, mut registries)) = stack.pop() {
        let node = controller.node();
        registries.push(node.ios());

        for (_, attribute) in node.attributes() {
            let Some(io_ref) = attribute.io_ref() else {
                continue;
            };
            if let Err(e) = io_ref.update_period() {
                let reason = match e {
                    FastCsError::Configuration(reason) => reason,
                    other => other.to_string(),
                };
                bad_periods.push(format!("{} ({reason})", attribute.full_name()));
            }
            let resolved = registries
                .iter()
                .rev()
                .find_map(|registry| registry.lookup(io_ref.as_ref()));
            match resolved {
                Some(io) if io.supports(attribute.datatype().kind()) => {
                    attribute.bind_io(io)?;
                    bound += 1;
                }
                Some(io) => unresolved.push(format!(
                    "{} ({} IO does not support {})",
                    attribute.full_name(),
                    io.ref_type_name(),
                    attribute.datatype().kind()
                )),
                None => unresolved.push(format!("{} ({io_ref:?})", attribute.full_name())),
            }
        }

        for (_, child) in node.sub_controllers().into_iter().rev() {
            stack.push((child, registries.clone()));
        }
    }

    let mut problems = Vec::new();
    if !unresolved.is_empty() {
        problems.push(format!("no AttributeIo found for: {}", unresolved.join(", ")));
    }
    if !bad_periods.is_empty() {
        problems.push(format!("invalid update period for: {}", bad_periods.join(", ")));
    }
    if problems.is_empty() {
        Ok(bound)
    } else {
        Err(FastCsError::Configuration(problems.join("; ")))
    }
}

fn validate_member_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('.') || name.chars().any(char::is_whitespace) {
        return Err(FastCsError::Configuration(format!(
            "invalid member name {name:?}"
        )));
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        return Err(FastCsError::Configuration(format!(
            "member name {name:?} is numeric, numeric names are reserved for vector indices"
        )));
    }
    Ok(())
}

fn index_key(key: &str) -> usize {
    key.parse().unwrap_or(usize::MAX)
}

fn display_path(path: &[String]) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.join(".")
    }
}

fn clone_entries<V: Clone>(map: &IndexMap<String, V>) -> Vec<(String, V)> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::DataType;
    use crate::io_ref::AttributeIoRef;
    use std::any::Any;

    #[derive(Debug)]
    struct RegisterRef(&'static str);

    impl AttributeIoRef for RegisterRef {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct RegisterIo;

    #[async_trait]
    impl AttributeIo for RegisterIo {
        type Ref = RegisterRef;

        fn supports(&self, kind: DataKind) -> bool {
            kind != DataKind::Waveform
        }
    }

    fn node() -> Arc<dyn Controller> {
        Arc::new(ControllerNode::new())
    }

    #[test]
    fn paths_follow_the_tree() {
        let root = node();
        let child = node();
        let grandchild = node();
        grandchild
            .node()
            .add_attribute("value", Attribute::read(DataType::int()).build())
            .unwrap();

        child.node().add_sub_controller("inner", grandchild.clone()).unwrap();
        root.node().add_sub_controller("outer", child.clone()).unwrap();

        assert_eq!(grandchild.node().path(), vec!["outer", "inner"]);
        let attr = grandchild.node().attribute("value").unwrap();
        assert_eq!(attr.full_name(), "outer.inner.value");
    }

    #[test]
    fn member_names_are_unique_across_kinds() {
        let root = ControllerNode::new();
        root.add_attribute("x", Attribute::read(DataType::int()).build())
            .unwrap();
        let err = root
            .add_command("x", Command::new(|| async { Ok(()) }))
            .unwrap_err();
        assert!(matches!(err, FastCsError::Configuration(_)));
    }

    #[test]
    fn numeric_and_dotted_names_rejected() {
        let root = ControllerNode::new();
        for name in ["1", "a.b", "", "two words"] {
            assert!(root.add_sub_controller(name, node()).is_err(), "{name:?}");
        }
    }

    #[test]
    fn controllers_have_one_parent_and_no_cycles() {
        let a = node();
        let b = node();
        let c = node();
        a.node().add_sub_controller("b", b.clone()).unwrap();
        b.node().add_sub_controller("c", c.clone()).unwrap();

        assert!(matches!(
            c.node().add_sub_controller("x", b.clone()),
            Err(FastCsError::Configuration(_))
        ));
        assert!(matches!(
            c.node().add_sub_controller("a", a.clone()),
            Err(FastCsError::Configuration(_))
        ));
        assert!(matches!(
            a.node().add_sub_controller("self", a.clone()),
            Err(FastCsError::Configuration(_))
        ));
    }

    #[test]
    fn sealed_node_rejects_changes() {
        let root = ControllerNode::new();
        root.seal();
        let err = root
            .add_attribute("late", Attribute::read(DataType::int()).build())
            .unwrap_err();
        assert!(matches!(err, FastCsError::Sealed(_)));
        assert!(matches!(
            root.add_sub_controller("late", node()),
            Err(FastCsError::Sealed(_))
        ));
    }

    #[test]
    fn attribute_owned_once() {
        let attr = Attribute::read(DataType::int()).build();
        let a = ControllerNode::new();
        let b = ControllerNode::new();
        a.add_attribute("x", attr.clone()).unwrap();
        assert!(b.add_attribute("x", attr).is_err());
    }

    #[test]
    fn walk_is_pre_order() {
        let root = node();
        let a = node();
        let b = node();
        let a1 = node();
        root.node().add_sub_controller("a", a.clone()).unwrap();
        root.node().add_sub_controller("b", b.clone()).unwrap();
        a.node().add_sub_controller("a1", a1.clone()).unwrap();

        let paths: Vec<String> = walk_tree(&root)
            .iter()
            .map(|c| c.node().path().join("."))
            .collect();
        assert_eq!(paths, vec!["", "a", "a.a1", "b"]);

        let paths: Vec<String> = post_order(&root)
            .iter()
            .map(|c| c.node().path().join("."))
            .collect();
        assert_eq!(paths, vec!["a.a1", "a", "b", ""]);
    }

    #[test]
    fn io_resolves_from_nearest_ancestor() {
        let root = node();
        let child = node();
        root.node().add_io(RegisterIo).unwrap();
        child
            .node()
            .add_attribute(
                "t",
                Attribute::read(DataType::float()).io_ref(RegisterRef("T")).build(),
            )
            .unwrap();
        root.node().add_sub_controller("child", child.clone()).unwrap();

        assert_eq!(bind_attribute_ios(&root).unwrap(), 1);
        assert!(child.node().attribute("t").unwrap().is_bound());
    }

    #[test]
    fn unresolved_attributes_listed_together() {
        let root = node();
        root.node()
            .add_attribute(
                "a",
                Attribute::read(DataType::float()).io_ref(RegisterRef("A")).build(),
            )
            .unwrap();
        root.node()
            .add_attribute(
                "b",
                Attribute::read(DataType::int()).io_ref(RegisterRef("B")).build(),
            )
            .unwrap();

        let err = bind_attribute_ios(&root).unwrap_err();
        let FastCsError::Configuration(message) = err else {
            panic!("expected configuration error");
        };
        assert!(message.contains("a (") && message.contains("b ("), "{message}");
    }

    #[test]
    fn unsupported_kind_is_unresolved() {
        let root = node();
        root.node().add_io(RegisterIo).unwrap();
        root.node()
            .add_attribute(
                "trace",
                Attribute::read(DataType::Waveform { max_len: 8 })
                    .io_ref(RegisterRef("W"))
                    .build(),
            )
            .unwrap();
        assert!(matches!(
            bind_attribute_ios(&root),
            Err(FastCsError::Configuration(_))
        ));
    }

    #[test]
    fn hints_are_checked() {
        let root = ControllerNode::new();
        root.declare_attribute("power", AccessMode::ReadWrite, DataKind::Float)
            .unwrap();
        root.declare_sub_controller("ramp").unwrap();
        assert!(root.validate_hints().is_err());

        root.add_attribute("power", Attribute::read(DataType::float()).build())
            .unwrap();
        root.add_sub_controller("ramp", node()).unwrap();
        let err = root.validate_hints().unwrap_err();
        assert!(err.to_string().contains("declared RW"), "{err}");
    }
}
