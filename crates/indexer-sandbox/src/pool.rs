//! One [`EntryPoint`] per mapping module.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::Instrument as _;

use crate::{
    TRACE_TARGET_SCRIPT,
    config::{ConfigError, SandboxConfig},
    datasource::DatasourceDescriptor,
    entry_point::{EntryPoint, EntryPointOptions},
    error::{Error, Result},
    host::{Binding, LoggerService, Service},
    runtime::Runtime,
};

/// Global name of the pool-scoped storage handle.
pub const STORE_BINDING: &str = "store";
/// Global name of the pool-scoped logger.
pub const LOGGER_BINDING: &str = "logger";
/// Global name of the caller's API handle, installed per call.
pub const API_BINDING: &str = "api";
/// Global name of the host API handle, installed per call in unsafe mode only.
pub const UNSAFE_API_BINDING: &str = "unsafeApi";

type Slot = Arc<OnceCell<Arc<EntryPoint>>>;

pub struct PoolBuilder {
    config: SandboxConfig,
    store: Option<Arc<dyn Service>>,
    api_service: Option<Arc<dyn Service>>,
    logger: Arc<dyn Service>,
}

impl PoolBuilder {
    /// Storage handle installed as `store` on every entry point.
    #[must_use]
    pub fn store(mut self, store: impl Service) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// The host's own API, exposed as `unsafeApi` in unsafe mode.
    #[must_use]
    pub fn api_service(mut self, api: impl Service) -> Self {
        self.api_service = Some(Arc::new(api));
        self
    }

    /// Replaces the default [`LoggerService`].
    #[must_use]
    pub fn logger(mut self, logger: impl Service) -> Self {
        self.logger = Arc::new(logger);
        self
    }

    /// # Errors
    /// [`ConfigError::MissingUnsafeApi`] if unsafe mode is on without an
    /// [`api_service`](Self::api_service).
    pub fn build(self) -> core::result::Result<Pool, ConfigError> {
        if self.config.unsafe_mode && self.api_service.is_none() {
            return Err(ConfigError::MissingUnsafeApi);
        }
        Ok(Pool {
            options: EntryPointOptions::from(&self.config),
            config: self.config,
            store: self.store,
            api_service: self.api_service,
            logger: self.logger,
            entries: Mutex::new(HashMap::new()),
            compilations: AtomicUsize::new(0),
        })
    }
}

/// Cache of entry points keyed by module path, living as long as the pool.
///
/// Entries are never evicted. Concurrent acquisitions of a path that is not
/// loaded yet share one construction; a failed construction is not cached.
pub struct Pool {
    config: SandboxConfig,
    options: EntryPointOptions,
    store: Option<Arc<dyn Service>>,
    api_service: Option<Arc<dyn Service>>,
    logger: Arc<dyn Service>,
    entries: Mutex<HashMap<String, Slot>>,
    compilations: AtomicUsize,
}

impl Pool {
    #[must_use]
    pub fn builder(config: SandboxConfig) -> PoolBuilder {
        PoolBuilder {
            config,
            store: None,
            api_service: None,
            logger: Arc::new(LoggerService::default()),
        }
    }

    /// Returns the entry point for the datasource's module, creating it on
    /// first use, together with the call-scoped bindings for `api`.
    ///
    /// # Errors
    /// [`Error::Descriptor`](crate::Error::Descriptor) if no module path can
    /// be derived, [`Error::Construction`](crate::Error::Construction) if the
    /// module fails to load.
    pub async fn acquire(
        &self,
        descriptor: &DatasourceDescriptor,
        api: impl Into<Binding>,
    ) -> Result<EntryPointLease> {
        let module_path = descriptor.module_path(&self.config.project_root)?;
        let span = tracing::info_span!(
            target: TRACE_TARGET_SCRIPT,
            "pool.acquire",
            module = %module_path,
            kind = %descriptor.kind,
        );

        let slot = Arc::clone(self.entries.lock().entry(module_path.clone()).or_default());
        let entry = slot
            .get_or_try_init(|| self.construct(module_path))
            .instrument(span)
            .await?;

        let mut call_bindings = vec![(API_BINDING.to_string(), api.into())];
        if let Some(api_service) = self.api_service.as_ref().filter(|_| self.config.unsafe_mode) {
            call_bindings.push((
                UNSAFE_API_BINDING.to_string(),
                Binding::Service(Arc::clone(api_service)),
            ));
        }
        Ok(EntryPointLease {
            entry: Arc::clone(entry),
            call_bindings,
        })
    }

    async fn construct(&self, module_path: String) -> Result<Arc<EntryPoint>> {
        let runtime = Runtime::create(self.config.policy(), &self.config.project_root)
            .await
            .map_err(|source| Error::Construction {
                module: module_path.clone(),
                source,
            })?;
        let mut pool_bindings = Vec::with_capacity(2);
        if let Some(store) = &self.store {
            pool_bindings.push((STORE_BINDING.to_string(), Binding::Service(Arc::clone(store))));
        }
        pool_bindings.push((
            LOGGER_BINDING.to_string(),
            Binding::Service(Arc::clone(&self.logger)),
        ));
        let entry =
            EntryPoint::create_with(module_path, runtime, self.options, pool_bindings).await?;
        self.compilations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: TRACE_TARGET_SCRIPT,
            module = entry.module_path(),
            "mapping module loaded"
        );
        Ok(Arc::new(entry))
    }

    /// Number of module paths with a loaded entry point.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of mapping modules compiled over the pool's lifetime.
    #[must_use]
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

/// A shared [`EntryPoint`] plus the bindings one caller attached to it.
pub struct EntryPointLease {
    entry: Arc<EntryPoint>,
    call_bindings: Vec<(String, Binding)>,
}

impl EntryPointLease {
    /// Invokes `name` with this lease's call-scoped bindings installed.
    ///
    /// # Errors
    /// See [`EntryPoint::invoke_with`].
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.entry
            .invoke_with(name, args, &self.call_bindings)
            .await
    }

    /// The instance shared by every lease for the same module path.
    #[must_use]
    pub const fn entry_point(&self) -> &Arc<EntryPoint> {
        &self.entry
    }

    /// Names of the globals installed for each call.
    pub fn binding_names(&self) -> impl Iterator<Item = &str> {
        self.call_bindings.iter().map(|(name, _)| name.as_str())
    }
}
