//! Integer-indexed collections of sub-controllers.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::controller::{Controller, ControllerNode, NodeKind};
use crate::error::{FastCsError, Result};

/// A controller whose children are addressed by integer index.
///
/// Indices need not be contiguous; iteration is always in ascending index
/// order. Named sub-controllers are rejected, but the vector may carry its
/// own attributes and methods like any other controller.
///
/// ```rust,ignore
/// let ramps = Arc::new(ControllerVector::new());
/// ramps.insert(1, Arc::new(RampController::new()))?;
/// ramps.insert(2, Arc::new(RampController::new()))?;
/// root.node().add_sub_controller("ramp", ramps.clone())?;
/// // attributes are now reachable as ramp.1.target, ramp.2.target
/// ```
pub struct ControllerVector<C: Controller> {
    node: ControllerNode,
    children: RwLock<BTreeMap<usize, Arc<C>>>,
}

impl<C: Controller> Default for ControllerVector<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Controller> ControllerVector<C> {
    /// Empty vector.
    pub fn new() -> Self {
        Self {
            node: ControllerNode::with_kind(NodeKind::Vector),
            children: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.node = self.node.with_description(description);
        self
    }

    /// Build from `(index, controller)` pairs.
    pub fn from_children(children: impl IntoIterator<Item = (usize, Arc<C>)>) -> Result<Self> {
        let vector = Self::new();
        for (index, child) in children {
            vector.insert(index, child)?;
        }
        Ok(vector)
    }

    /// Add a child at `index`.
    ///
    /// # Errors
    ///
    /// `Configuration` if the index is taken or the child already has a
    /// parent, `Sealed` after the API snapshot.
    pub fn insert(&self, index: usize, controller: Arc<C>) -> Result<()> {
        let dynamic: Arc<dyn Controller> = controller.clone();
        self.node.insert_indexed(index, dynamic)?;
        self.children.write().insert(index, controller);
        Ok(())
    }

    /// Child at `index`.
    ///
    /// # Errors
    ///
    /// `NotFound` if no child has that index.
    pub fn get(&self, index: usize) -> Result<Arc<C>> {
        self.children.read().get(&index).cloned().ok_or_else(|| {
            FastCsError::NotFound(format!(
                "no controller at index {index} in '{}'",
                self.node.display_path()
            ))
        })
    }

    /// Children in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Arc<C>)> {
        let snapshot: Vec<(usize, Arc<C>)> = self
            .children
            .read()
            .iter()
            .map(|(index, child)| (*index, child.clone()))
            .collect();
        snapshot.into_iter()
    }

    /// Occupied indices, ascending.
    pub fn indices(&self) -> Vec<usize> {
        self.children.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.children.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.read().is_empty()
    }
}

#[async_trait]
impl<C: Controller> Controller for ControllerVector<C> {
    fn node(&self) -> &ControllerNode {
        &self.node
    }
}
