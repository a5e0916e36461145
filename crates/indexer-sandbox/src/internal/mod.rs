use std::{future::Future, sync::Arc};

use tokio::runtime::Handle;

use crate::policy::SecurityPolicy;

pub mod bootstrap;
pub mod cache;
pub mod capability;
pub mod console;
pub mod convert;
pub mod deadline;
pub mod resolve;
pub mod service;
pub mod socket;
pub mod worker;

/// Host state shared by every native function of one engine.
#[derive(Debug)]
pub struct HostEnv {
    pub policy: Arc<SecurityPolicy>,
    pub resolver: resolve::Resolver,
    pub deadline: Arc<deadline::Deadline>,
    /// Runtime that host service futures are driven on.
    pub handle: Option<Handle>,
    /// Client for the `http`/`https` capabilities, built on first use.
    pub http: std::sync::OnceLock<reqwest::Client>,
    pub sockets: socket::Sockets,
}

impl HostEnv {
    pub fn new(
        policy: Arc<SecurityPolicy>,
        resolver: resolve::Resolver,
        deadline: Arc<deadline::Deadline>,
        handle: Option<Handle>,
    ) -> Self {
        Self {
            policy,
            resolver,
            deadline,
            handle,
            http: std::sync::OnceLock::new(),
            sockets: socket::Sockets::default(),
        }
    }

    /// Blocks the engine thread on `future`, driven by the host runtime and
    /// cut off at the deadline of the running call. `what` prefixes errors.
    pub fn block_on<F: Future>(&self, what: &str, future: F) -> Result<F::Output, String> {
        let Some(handle) = self.handle.as_ref() else {
            return Err(format!(
                "{what}: needs a tokio runtime, none was running when the sandbox started"
            ));
        };
        match self.deadline.remaining() {
            Some(remaining) => handle
                .block_on(async { tokio::time::timeout(remaining, future).await })
                .map_err(|_| format!("{what}: did not complete before the deadline")),
            None => Ok(handle.block_on(future)),
        }
    }
}
