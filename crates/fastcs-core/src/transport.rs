//! Transport contract.
//!
//! A transport exposes the [`ControllerApi`] to some outside protocol. The
//! backend hands every transport the API snapshot and a [`LoopHandoff`] in
//! `connect`, then runs `serve` as a task until shutdown is requested.
//!
//! Transports that own a dedicated thread (for example a protocol library
//! with its own blocking server loop) must not touch attributes from that
//! thread directly; they route calls back onto the backend's event loop with
//! [`LoopHandoff::blocking_call`].

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::controller_api::ControllerApi;
use crate::error::{FastCsError, Result};

/// Protocol adapter serving a [`ControllerApi`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Receive the API snapshot. Called once, before [`Transport::serve`].
    async fn connect(&self, api: Arc<ControllerApi>, handoff: LoopHandoff) -> Result<()>;

    /// Serve requests until `shutdown` is cancelled.
    async fn serve(&self, shutdown: CancellationToken) -> Result<()>;
}

/// Runs futures on the backend's event loop from anywhere.
#[derive(Debug, Clone)]
pub struct LoopHandoff {
    handle: Handle,
}

impl LoopHandoff {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Runtime handle of the backend's loop.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `future` on the event loop and await its output.
    pub async fn call<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future).await.map_err(join_error)
    }

    /// Run `future` on the event loop and block the current thread until it
    /// completes.
    ///
    /// # Panics
    ///
    /// When called from inside an async task; use [`LoopHandoff::call`] there.
    pub fn blocking_call<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let task = self.handle.spawn(future);
        self.handle.block_on(task).map_err(join_error)
    }
}

fn join_error(e: tokio::task::JoinError) -> FastCsError {
    FastCsError::Transport {
        name: "loop handoff".into(),
        message: e.to_string(),
    }
}
