//! Lifecycle backend.
//!
//! [`Backend`] drives a controller tree through its lifecycle on one tokio
//! runtime handle:
//!
//! ```text
//! Constructed -> Initialising -> ApiBuilt -> Connecting -> Running -> ShuttingDown -> Stopped
//!                     |                          |
//!                     +--------> Failed <--------+
//! ```
//!
//! 1. **initialise**: every controller's `initialise` hook runs, pre-order and
//!    sequentially. Declared members are checked, attribute IOs are bound and
//!    the tree is sealed.
//! 2. **API**: the [`ControllerApi`] snapshot is built, exactly once.
//! 3. **connect**: every controller's `connect` hook runs, pre-order. The
//!    first failure aborts startup before any task is scheduled.
//! 4. **start**: one-shot updates run, periodic update and scan tasks are
//!    spawned and transports start serving.
//!
//! [`Backend::serve`] then suspends until [`Backend::request_shutdown`] is
//! called, after which all tasks are cancelled and controllers disconnected.
//!
//! # Example
//!
//! ```rust,ignore
//! let backend = Backend::new(controller, Handle::current())
//!     .with_config(BackendConfig::default());
//! let stop = backend.shutdown_handle();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     stop.cancel();
//! });
//! backend.run().await?;
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::{bind_attribute_ios, post_order, walk_tree, Controller};
use crate::controller_api::ControllerApi;
use crate::error::{FastCsError, Result};
use crate::io_ref::UpdatePeriod;
use crate::scheduler::{run_periodic, TaskSet};
use crate::transport::{LoopHandoff, Transport};

/// Backend tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// How long shutdown waits for tasks before aborting them
    pub shutdown_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle phase of a [`Backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Built, nothing run yet
    Constructed,
    /// Running controller `initialise` hooks and binding IOs
    Initialising,
    /// Tree sealed and the API snapshot taken
    ApiBuilt,
    /// Running `connect` hooks and transport connects
    Connecting,
    /// Periodic tasks and transports are running
    Running,
    /// Cancelling tasks and disconnecting controllers
    ShuttingDown,
    /// Shut down
    Stopped,
    /// Startup failed; only shutdown is possible
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Constructed => "constructed",
            LifecycleState::Initialising => "initialising",
            LifecycleState::ApiBuilt => "api built",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting down",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

/// Runs a controller tree and its transports on one event loop.
pub struct Backend {
    controller: Arc<dyn Controller>,
    handle: Handle,
    config: BackendConfig,
    transports: Vec<Arc<dyn Transport>>,
    state: watch::Sender<LifecycleState>,
    api: OnceLock<Arc<ControllerApi>>,
    shutdown: CancellationToken,
    tasks: Mutex<TaskSet>,
    connect_attempted: AtomicBool,
    stopping: AtomicBool,
}

impl Backend {
    /// Create a backend spawning all tasks onto `handle`.
    pub fn new(controller: Arc<dyn Controller>, handle: Handle) -> Self {
        let (state, _) = watch::channel(LifecycleState::Constructed);
        Self {
            controller,
            handle,
            config: BackendConfig::default(),
            transports: Vec::new(),
            state,
            api: OnceLock::new(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(TaskSet::default()),
            connect_attempted: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    /// Create a backend on the runtime of the calling task.
    ///
    /// # Errors
    ///
    /// `Configuration` when called outside a tokio runtime.
    pub fn from_current(controller: Arc<dyn Controller>) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| FastCsError::Configuration(format!("no tokio runtime: {e}")))?;
        Ok(Self::new(controller, handle))
    }

    /// Replace the default [`BackendConfig`].
    pub fn with_config(mut self, config: BackendConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a transport, connected and served in registration order.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Root of the controller tree.
    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.controller
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// The API snapshot, available once initialisation completed.
    pub fn api(&self) -> Option<Arc<ControllerApi>> {
        self.api.get().cloned()
    }

    /// Token that stops [`Backend::serve`] when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handle for running async work on the backend's loop from other threads.
    pub fn handoff(&self) -> LoopHandoff {
        LoopHandoff::new(self.handle.clone())
    }

    /// Number of tasks started by the start phase.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Run every phase, serve until shutdown is requested, then shut down.
    pub async fn run(&self) -> Result<()> {
        self.initialise().await?;
        if let Err(e) = self.connect().await {
            if let Err(shutdown_error) = self.shutdown().await {
                warn!(error = %shutdown_error, "Cleanup after failed startup reported errors");
            }
            return Err(e);
        }
        self.serve().await
    }

    /// Initialise the tree, bind attribute IOs, seal it and build the API.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless freshly constructed; otherwise the first hook
    /// error, or `Configuration` for unmet declarations and unresolvable IOs.
    pub async fn initialise(&self) -> Result<()> {
        self.transition(
            LifecycleState::Constructed,
            LifecycleState::Initialising,
            "initialise",
        )?;
        info!("Initialising controller tree");

        match self.initialise_tree().await {
            Ok(api) => {
                let attributes: usize = api.walk_api().map(|a| a.attributes().len()).sum();
                info!(
                    controllers = api.walk_api().count(),
                    attributes, "Controller API built"
                );
                self.api.set(api).map_err(|_| FastCsError::InvalidState {
                    operation: "build the controller API",
                    state: "api already built".into(),
                })?;
                self.state.send_replace(LifecycleState::ApiBuilt);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Initialisation failed");
                self.state.send_replace(LifecycleState::Failed);
                Err(e)
            }
        }
    }

    async fn initialise_tree(&self) -> Result<Arc<ControllerApi>> {
        // Children are listed only after their parent's hook ran, so members
        // created during initialise are initialised too.
        let mut stack = vec![self.controller.clone()];
        while let Some(controller) = stack.pop() {
            debug!(controller = %controller.node().display_path(), "Initialising");
            controller.initialise().await?;
            let children = controller.node().sub_controllers();
            stack.extend(children.into_iter().rev().map(|(_, child)| child));
        }

        let tree = walk_tree(&self.controller);
        let problems: Vec<String> = tree
            .iter()
            .filter_map(|c| c.node().validate_hints().err())
            .map(|e| e.to_string())
            .collect();
        if !problems.is_empty() {
            return Err(FastCsError::Configuration(problems.join("; ")));
        }

        let bound = bind_attribute_ios(&self.controller)?;
        debug!(bound, "Bound attribute IOs");

        for controller in &tree {
            controller.node().seal();
        }
        Ok(Arc::new(ControllerApi::build(&self.controller)))
    }

    /// Connect controllers, then start updates, scans and transports.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the API was built; `ConnectionEstablishment`
    /// for the first failing controller, `Transport` for a failing transport
    /// connect. No task is running after an error.
    pub async fn connect(&self) -> Result<()> {
        self.transition(LifecycleState::ApiBuilt, LifecycleState::Connecting, "connect")?;
        self.connect_attempted.store(true, Ordering::SeqCst);
        info!("Connecting controllers");

        if let Err(e) = self.connect_tree().await {
            error!(error = %e, "Connect failed, aborting startup");
            self.state.send_replace(LifecycleState::Failed);
            return Err(e);
        }
        let api = self.api().ok_or_else(|| FastCsError::InvalidState {
            operation: "connect",
            state: "no controller API".into(),
        })?;

        self.run_one_shot_updates(&api).await;

        if let Err(e) = self.connect_transports(&api).await {
            error!(error = %e, "Transport connect failed, aborting startup");
            self.state.send_replace(LifecycleState::Failed);
            return Err(e);
        }

        let started = self.start_tasks(&api);
        info!(tasks = started, "Backend running");
        self.state.send_replace(LifecycleState::Running);
        Ok(())
    }

    async fn connect_tree(&self) -> Result<()> {
        for controller in walk_tree(&self.controller) {
            let path = controller.node().display_path();
            debug!(controller = %path, "Connecting");
            controller
                .connect()
                .await
                .map_err(|e| FastCsError::ConnectionEstablishment {
                    controller: path,
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn run_one_shot_updates(&self, api: &ControllerApi) {
        for node in api.walk_api() {
            for attribute in node.attributes().values() {
                // Periods were validated while binding IOs
                if !matches!(attribute.update_period(), Ok(Some(UpdatePeriod::Once)))
                    || !attribute.access_mode().can_update()
                {
                    continue;
                }
                if let Err(e) = attribute.refresh().await {
                    warn!(attribute = %attribute.full_name(), error = %e, "One-shot update failed");
                }
            }
        }
    }

    async fn connect_transports(&self, api: &Arc<ControllerApi>) -> Result<()> {
        for transport in &self.transports {
            info!(transport = transport.name(), "Connecting transport");
            transport
                .connect(api.clone(), self.handoff())
                .await
                .map_err(|e| FastCsError::Transport {
                    name: transport.name().to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn start_tasks(&self, api: &ControllerApi) -> usize {
        let mut tasks = self.tasks.lock();

        for node in api.walk_api() {
            for attribute in node.attributes().values() {
                let Ok(Some(UpdatePeriod::Every(period))) = attribute.update_period() else {
                    continue;
                };
                if !attribute.access_mode().can_update() {
                    continue;
                }
                let name = format!("update:{}", attribute.full_name());
                let attribute = attribute.clone();
                let task = run_periodic(name.clone(), period, self.shutdown.child_token(), move || {
                    let attribute = attribute.clone();
                    async move { attribute.refresh().await }
                });
                tasks.spawn_on(name, task, &self.handle);
            }

            for (method, scan) in node.scan_methods() {
                let mut segments = node.path().to_vec();
                segments.push(method.clone());
                let name = format!("scan:{}", segments.join("."));
                let scan = scan.clone();
                let task = run_periodic(
                    name.clone(),
                    scan.schedule(),
                    self.shutdown.child_token(),
                    move || {
                        let scan = scan.clone();
                        async move { scan.call().await }
                    },
                );
                tasks.spawn_on(name, task, &self.handle);
            }
        }

        for transport in &self.transports {
            let name = format!("transport:{}", transport.name());
            let transport = transport.clone();
            let token = self.shutdown.child_token();
            let task_name = name.clone();
            tasks.spawn_on(
                name,
                async move {
                    if let Err(e) = transport.serve(token).await {
                        error!(task = %task_name, error = %e, "Transport stopped with error");
                    }
                },
                &self.handle,
            );
        }

        tasks.len()
    }

    /// Suspend until shutdown is requested, then shut down.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless running; otherwise whatever shutdown reports.
    pub async fn serve(&self) -> Result<()> {
        let state = self.state();
        if state != LifecycleState::Running {
            return Err(FastCsError::InvalidState {
                operation: "serve",
                state: state.to_string(),
            });
        }
        info!("Serving until shutdown is requested");
        self.shutdown.cancelled().await;
        self.shutdown().await
    }

    /// Ask a running [`Backend::serve`] to return.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancel all tasks and disconnect every controller.
    ///
    /// Tasks get `shutdown_timeout` to stop before being aborted. Controllers
    /// are disconnected children first. Calling this more than once is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// `ShutdownFailed` listing panicked or aborted tasks and failed
    /// disconnects. The backend is stopped either way.
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down");
        self.shutdown.cancel();
        self.state.send_replace(LifecycleState::ShuttingDown);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut errors = tasks.join_all(self.config.shutdown_timeout).await;

        if self.connect_attempted.load(Ordering::SeqCst) {
            for controller in post_order(&self.controller) {
                let path = controller.node().display_path();
                debug!(controller = %path, "Disconnecting");
                if let Err(e) = controller.disconnect().await {
                    warn!(controller = %path, error = %e, "Disconnect failed");
                    errors.push(e);
                }
            }
        }

        self.state.send_replace(LifecycleState::Stopped);
        if errors.is_empty() {
            info!("Backend stopped");
            Ok(())
        } else {
            error!(errors = errors.len(), "Backend stopped with errors");
            Err(FastCsError::ShutdownFailed(errors))
        }
    }

    fn transition(
        &self,
        from: LifecycleState,
        to: LifecycleState,
        operation: &'static str,
    ) -> Result<()> {
        let mut current = from;
        let moved = self.state.send_if_modified(|state| {
            current = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            Ok(())
        } else {
            Err(FastCsError::InvalidState {
                operation,
                state: current.to_string(),
            })
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("state", &self.state())
            .field("transports", &self.transports.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use crate::controller::ControllerNode;
    use crate::datatype::DataType;

    #[tokio::test]
    async fn phases_must_run_in_order() {
        let backend = Backend::new(Arc::new(ControllerNode::new()), Handle::current());
        assert!(matches!(
            backend.connect().await,
            Err(FastCsError::InvalidState { operation: "connect", .. })
        ));
        assert!(matches!(
            backend.serve().await,
            Err(FastCsError::InvalidState { operation: "serve", .. })
        ));

        backend.initialise().await.unwrap();
        assert_eq!(backend.state(), LifecycleState::ApiBuilt);
        assert!(matches!(
            backend.initialise().await,
            Err(FastCsError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn tree_is_sealed_after_initialise() {
        let root = Arc::new(ControllerNode::new());
        let backend = Backend::new(root.clone(), Handle::current());
        backend.initialise().await.unwrap();
        let err = root
            .add_attribute("late", Attribute::read(DataType::int()).build())
            .unwrap_err();
        assert!(matches!(err, FastCsError::Sealed(_)));
    }

    #[tokio::test]
    async fn state_changes_are_observable() {
        let backend = Backend::new(Arc::new(ControllerNode::new()), Handle::current());
        let mut states = backend.subscribe_state();
        backend.initialise().await.unwrap();
        backend.connect().await.unwrap();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), LifecycleState::Running);

        backend.request_shutdown();
        backend.serve().await.unwrap();
        assert_eq!(backend.state(), LifecycleState::Stopped);
        // second shutdown is a no-op
        backend.shutdown().await.unwrap();
    }

    #[test]
    fn from_current_requires_runtime() {
        let result = Backend::from_current(Arc::new(ControllerNode::new()));
        assert!(matches!(result, Err(FastCsError::Configuration(_))));
    }
}
