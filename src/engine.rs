// ============================================================================
// Engine
// ============================================================================
//
// Wires the collaborators (row backend, object storage, caches, notifier,
// authenticator, clock) and exposes the transport entry point:
// `execute(name, args, token)` builds the named operation from the registry
// and runs it through the lifecycle.
// ============================================================================

use crate::cache::{RowCache, TenantDirectory};
use crate::config::EngineConfig;
use crate::core::{EngineError, Result};
use crate::operation::{
    Authenticator, Clock, JsonTokenAuthenticator, NoopNotifier, Notifier, Operation,
    OperationRegistry, SystemClock,
};
use crate::storage::{InMemoryBackend, MemoryObjectStorage, ObjectStorage, StorageBackend};
use crate::sync::{SYNC_OPERATION, SyncOperation};
use serde_json::Value;
use std::sync::{Arc, RwLock};

struct EngineInner {
    config: EngineConfig,
    backend: Arc<dyn StorageBackend>,
    objects: Arc<dyn ObjectStorage>,
    cache: Arc<RowCache>,
    directory: TenantDirectory,
    notifier: Arc<dyn Notifier>,
    authenticator: Arc<dyn Authenticator>,
    clock: Arc<dyn Clock>,
    registry: RwLock<OperationRegistry>,
}

/// Shared handle; clones are cheap and see the same state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.backend
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStorage> {
        &self.inner.objects
    }

    pub fn cache(&self) -> &Arc<RowCache> {
        &self.inner.cache
    }

    pub fn directory(&self) -> &TenantDirectory {
        &self.inner.directory
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.inner.notifier
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.inner.authenticator
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Registers (or replaces) an operation factory.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(Value) -> Result<Box<dyn Operation>> + Send + Sync + 'static,
    {
        let mut registry = self.inner.registry.write()?;
        registry.register(name, factory);
        Ok(())
    }

    pub fn operation_names(&self) -> Result<Vec<String>> {
        Ok(self.inner.registry.read()?.names())
    }

    /// Transport entry point.
    pub async fn execute(&self, name: &str, args: Value, token: Option<&str>) -> Result<Value> {
        let mut op = {
            let registry = self.inner.registry.read()?;
            registry.create(name, args)?
        };
        self.run(op.as_mut(), token).await
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    backend: Option<Arc<dyn StorageBackend>>,
    objects: Option<Arc<dyn ObjectStorage>>,
    notifier: Option<Arc<dyn Notifier>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    clock: Option<Arc<dyn Clock>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            backend: None,
            objects: None,
            notifier: None,
            authenticator: None,
            clock: None,
        }
    }
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn objects(mut self, objects: Arc<dyn ObjectStorage>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Engine> {
        if self.config.gc.step_backoffs_ms.is_empty() {
            return Err(EngineError::unexpected("gc.step_backoffs_ms must not be empty"));
        }
        let budget = self.config.sync.budget;
        let mut registry = OperationRegistry::new();
        registry.register(SYNC_OPERATION, move |args| {
            Ok(Box::new(SyncOperation::from_args(args, budget)?) as Box<dyn Operation>)
        });

        let inner = EngineInner {
            cache: Arc::new(RowCache::new(self.config.cache.capacity)),
            directory: TenantDirectory::new(
                self.config.directory.ttl(),
                self.config.directory.min_reload(),
            ),
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(InMemoryBackend::new())),
            objects: self
                .objects
                .unwrap_or_else(|| Arc::new(MemoryObjectStorage::new())),
            notifier: self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier)),
            authenticator: self
                .authenticator
                .unwrap_or_else(|| Arc::new(JsonTokenAuthenticator)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            registry: RwLock::new(registry),
            config: self.config,
        };
        Ok(Engine {
            inner: Arc::new(inner),
        })
    }
}
