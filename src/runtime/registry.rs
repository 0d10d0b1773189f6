use super::{FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::Codec;
use crate::{OrchestrationContext, TaskFailure};
use async_trait::async_trait;
use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

/// Version assigned by the unversioned `register*` helpers.
pub const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    pub(crate) inner: Arc<HashMap<String, BTreeMap<Version, Arc<dyn OrchestrationHandler>>>>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// New instances always start on the latest registered version.
    pub fn resolve_for_start(&self, name: &str) -> Option<(Version, Arc<dyn OrchestrationHandler>)> {
        let (v, h) = self.inner.get(name)?.iter().next_back()?;
        Some((v.clone(), h.clone()))
    }

    /// Replays resolve the exact version recorded when the instance started.
    pub fn resolve_exact(&self, name: &str, v: &Version) -> Option<Arc<dyn OrchestrationHandler>> {
        self.inner.get(name)?.get(v).cloned()
    }
}

pub struct OrchestrationRegistryBuilder {
    map: HashMap<String, BTreeMap<Version, Arc<dyn OrchestrationHandler>>>,
    errors: Vec<String>,
}

impl OrchestrationRegistryBuilder {
    fn insert(&mut self, name: String, v: Version, handler: Arc<dyn OrchestrationHandler>) {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&v) {
            self.errors
                .push(format!("duplicate orchestration registration: {name}@{v}"));
            return;
        }
        entry.insert(v, handler);
    }

    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_versioned(name, DEFAULT_VERSION, f)
    }

    /// Register a handler under an explicit version. Versions for one name
    /// must be registered in increasing order.
    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: Version, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        if let Some((latest, _)) = self.map.get(&name).and_then(|m| m.iter().next_back()) {
            if &version < latest {
                self.errors.push(format!(
                    "non-monotonic orchestration version for {name}: {version} is earlier than {latest}"
                ));
                return self;
            }
        }
        self.insert(name, version, Arc::new(FnOrchestration(f)));
        self
    }

    pub fn build(self) -> OrchestrationRegistry {
        if !self.errors.is_empty() {
            tracing::warn!(errors = %self.errors.join("; "), "orchestration registry built with errors");
        }
        OrchestrationRegistry {
            inner: Arc::new(self.map),
        }
    }

    pub fn build_result(self) -> Result<OrchestrationRegistry, String> {
        if self.errors.is_empty() {
            Ok(OrchestrationRegistry {
                inner: Arc::new(self.map),
            })
        } else {
            Err(self.errors.join("; "))
        }
    }
}

// ---------------- Activity registry

/// Per-invocation information handed to an activity.
#[derive(Clone, Debug)]
pub struct ActivityContext {
    pub instance: String,
    pub id: u64,
    pub name: String,
    cancel: watch::Receiver<bool>,
}

impl ActivityContext {
    pub fn new(instance: impl Into<String>, id: u64, name: impl Into<String>, cancel: watch::Receiver<bool>) -> Self {
        Self {
            instance: instance.into(),
            id,
            name: name.into(),
            cancel,
        }
    }

    /// A context with a cancellation signal that never fires.
    pub fn detached(name: impl Into<String>) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new("detached", 0, name, rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the owning instance is terminated.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without a cancel: never resolves
                std::future::pending::<()>().await;
            }
        }
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, TaskFailure>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, TaskFailure>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, TaskFailure>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, TaskFailure> {
        (self.0)(ctx, input).await
    }
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { map: HashMap::new() }
    }
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }
}

impl ActivityRegistryBuilder {
    /// Register a plain string activity; an `Err` becomes `TaskFailure::Failed`.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |_ctx: ActivityContext, input: String| {
            let f = f.clone();
            async move { f(input).await.map_err(TaskFailure::Failed) }
        };
        self.map.insert(name.into(), Arc::new(FnActivity(wrapper)));
        self
    }

    /// Register an activity that needs its context (cancellation, ids).
    pub fn register_with_context<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, TaskFailure>> + Send + 'static,
    {
        self.map.insert(name.into(), Arc::new(FnActivity(f)));
        self
    }

    /// Register a typed activity; undecodable input fails with `InvalidInput`.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, TaskFailure>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s).map_err(TaskFailure::InvalidInput)?;
                let out: Out = f(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out).map_err(TaskFailure::Failed)
            }
        };
        self.map.insert(name.into(), Arc::new(FnActivity(wrapper)));
        self
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}
