//! Read-only snapshot of the controller tree for transports.
//!
//! [`ControllerApi`] mirrors the tree after initialisation: one node per
//! controller holding its attributes and methods. Attribute handles in the
//! snapshot are the live attributes, so values seen through the API are always
//! current; only the *shape* is frozen.
//!
//! Transports walk the snapshot with [`ControllerApi::walk_api`] to publish
//! records, and route client requests with [`ControllerApi::dispatch`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::attribute::Attribute;
use crate::controller::{Controller, NodeKind};
use crate::datatype::Value;
use crate::error::{FastCsError, Result};
use crate::methods::{Command, Put, Scan};

/// Snapshot of one controller.
#[derive(Debug, Clone)]
pub struct ControllerApi {
    path: Vec<String>,
    description: Option<String>,
    is_vector: bool,
    attributes: IndexMap<String, Attribute>,
    command_methods: IndexMap<String, Command>,
    put_methods: IndexMap<String, Put>,
    scan_methods: IndexMap<String, Scan>,
    sub_apis: IndexMap<String, ControllerApi>,
}

impl ControllerApi {
    /// Snapshot `root` and its whole subtree.
    pub fn build(root: &Arc<dyn Controller>) -> Self {
        let node = root.node();
        Self {
            path: node.path(),
            description: node.description(),
            is_vector: node.kind() == NodeKind::Vector,
            attributes: node.attributes().into_iter().collect(),
            command_methods: node.commands().into_iter().collect(),
            put_methods: node.puts().into_iter().collect(),
            scan_methods: node.scans().into_iter().collect(),
            sub_apis: node
                .sub_controllers()
                .into_iter()
                .map(|(name, child)| (name, Self::build(&child)))
                .collect(),
        }
    }

    /// Path segments from the root.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Whether this node mirrors a `ControllerVector`.
    pub fn is_vector(&self) -> bool {
        self.is_vector
    }

    /// Attributes in declaration order.
    pub fn attributes(&self) -> &IndexMap<String, Attribute> {
        &self.attributes
    }

    pub fn command_methods(&self) -> &IndexMap<String, Command> {
        &self.command_methods
    }

    pub fn put_methods(&self) -> &IndexMap<String, Put> {
        &self.put_methods
    }

    pub fn scan_methods(&self) -> &IndexMap<String, Scan> {
        &self.scan_methods
    }

    /// Child snapshots keyed by member name.
    pub fn sub_apis(&self) -> &IndexMap<String, ControllerApi> {
        &self.sub_apis
    }

    /// Pre-order iterator over this node and every descendant.
    ///
    /// Lazy and restartable: each call starts a fresh walk over the same
    /// snapshot.
    pub fn walk_api(&self) -> WalkApi<'_> {
        WalkApi { stack: vec![self] }
    }

    // =========================================================================
    // Path lookups
    // =========================================================================

    /// Sub-API at a dotted path relative to this node (`""` is this node).
    pub fn sub_api(&self, path: &str) -> Result<&ControllerApi> {
        if path.is_empty() {
            return Ok(self);
        }
        path.split('.').try_fold(self, |api, segment| {
            api.sub_apis
                .get(segment)
                .ok_or_else(|| FastCsError::NotFound(format!("no controller at '{path}'")))
        })
    }

    /// Attribute at a dotted path such as `ramp.1.target`.
    pub fn attribute_at(&self, path: &str) -> Result<&Attribute> {
        let (api, name) = self.split_member(path)?;
        api.attributes
            .get(name)
            .ok_or_else(|| FastCsError::NotFound(format!("no attribute at '{path}'")))
    }

    /// Command at a dotted path.
    pub fn command_at(&self, path: &str) -> Result<&Command> {
        let (api, name) = self.split_member(path)?;
        api.command_methods
            .get(name)
            .ok_or_else(|| FastCsError::NotFound(format!("no command at '{path}'")))
    }

    /// Put method at a dotted path.
    pub fn put_at(&self, path: &str) -> Result<&Put> {
        let (api, name) = self.split_member(path)?;
        api.put_methods
            .get(name)
            .ok_or_else(|| FastCsError::NotFound(format!("no put method at '{path}'")))
    }

    fn split_member<'a>(&self, path: &'a str) -> Result<(&ControllerApi, &'a str)> {
        match path.rsplit_once('.') {
            Some((parent, name)) => Ok((self.sub_api(parent)?, name)),
            None => Ok((self, path)),
        }
    }

    // =========================================================================
    // Request dispatch
    // =========================================================================

    /// Route a client request to the addressed member.
    pub async fn dispatch(&self, request: ApiRequest) -> Result<ApiResponse> {
        tracing::debug!(?request, "Dispatching API request");
        match request {
            ApiRequest::Read { path } => Ok(ApiResponse::Value(self.attribute_at(&path)?.get())),
            ApiRequest::Write { path, value } => {
                self.attribute_at(&path)?.put(value, true).await?;
                Ok(ApiResponse::Done)
            }
            ApiRequest::Command { path } => {
                self.command_at(&path)?.call().await?;
                Ok(ApiResponse::Done)
            }
            ApiRequest::Put { path, value } => {
                self.put_at(&path)?.call(value).await?;
                Ok(ApiResponse::Done)
            }
        }
    }
}

/// Pre-order walk over a [`ControllerApi`] tree.
pub struct WalkApi<'a> {
    stack: Vec<&'a ControllerApi>,
}

impl<'a> Iterator for WalkApi<'a> {
    type Item = &'a ControllerApi;

    fn next(&mut self) -> Option<Self::Item> {
        let api = self.stack.pop()?;
        self.stack.extend(api.sub_apis.values().rev());
        Some(api)
    }
}

/// Client request addressed by dotted member path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ApiRequest {
    /// Current value of an attribute
    Read { path: String },
    /// Put to a Write/ReadWrite attribute
    Write { path: String, value: Value },
    /// Invoke a command
    Command { path: String },
    /// Invoke a put method
    Put { path: String, value: Value },
}

/// Result of a dispatched [`ApiRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiResponse {
    /// Value returned by a read
    Value(Value),
    /// Write, command or put completed
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerNode;
    use crate::controller_vector::ControllerVector;
    use crate::datatype::DataType;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn tree() -> Arc<dyn Controller> {
        let root = ControllerNode::new();
        root.add_attribute("power", Attribute::read_write(DataType::float()).build())
            .unwrap();

        let ramps = Arc::new(ControllerVector::new());
        for index in [1, 2] {
            let ramp = Arc::new(ControllerNode::new());
            ramp.add_attribute("target", Attribute::read_write(DataType::float()).build())
                .unwrap();
            ramps.insert(index, ramp).unwrap();
        }
        root.add_sub_controller("ramp", ramps).unwrap();
        root.add_sub_controller("status", Arc::new(ControllerNode::new()))
            .unwrap();
        Arc::new(root)
    }

    #[test]
    fn one_api_node_per_controller() {
        let api = ControllerApi::build(&tree());
        assert_eq!(api.walk_api().count(), 5);
        assert!(api.sub_api("ramp").unwrap().is_vector());
    }

    #[test]
    fn walk_is_pre_order_and_restartable() {
        let api = ControllerApi::build(&tree());
        let first: Vec<String> = api.walk_api().map(|a| a.path().join(".")).collect();
        let second: Vec<String> = api.walk_api().map(|a| a.path().join(".")).collect();
        assert_eq!(first, vec!["", "ramp", "ramp.1", "ramp.2", "status"]);
        assert_eq!(first, second);
    }

    #[test]
    fn path_lookups() {
        let api = ControllerApi::build(&tree());
        assert_eq!(api.attribute_at("ramp.2.target").unwrap().full_name(), "ramp.2.target");
        assert!(api.attribute_at("power").is_ok());
        assert!(matches!(
            api.attribute_at("ramp.3.target"),
            Err(FastCsError::NotFound(_))
        ));
        assert!(matches!(api.command_at("power"), Err(FastCsError::NotFound(_))));
    }

    #[tokio::test]
    async fn dispatch_routes_requests() {
        let root = ControllerNode::new();
        root.add_attribute("gain", Attribute::read_write(DataType::int()).build())
            .unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        root.add_command(
            "reset",
            Command::new(move || {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();
        let root: Arc<dyn Controller> = Arc::new(root);
        let api = ControllerApi::build(&root);

        let response = api
            .dispatch(ApiRequest::Write {
                path: "gain".into(),
                value: Value::Int(3),
            })
            .await
            .unwrap();
        assert_eq!(response, ApiResponse::Done);
        assert_eq!(
            api.dispatch(ApiRequest::Read { path: "gain".into() }).await.unwrap(),
            ApiResponse::Value(Value::Int(3))
        );

        api.dispatch(ApiRequest::Command { path: "reset".into() })
            .await
            .unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn requests_deserialize_from_json() {
        let request: ApiRequest =
            serde_json::from_str(r#"{"op":"write","path":"ramp.1.target","value":{"float":2.5}}"#)
                .unwrap();
        assert_eq!(
            request,
            ApiRequest::Write {
                path: "ramp.1.target".into(),
                value: Value::Float(2.5),
            }
        );
    }
}
