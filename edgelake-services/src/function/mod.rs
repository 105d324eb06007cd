//! Function serviceable: a WASM entry point triggered by HTTP or pub-sub.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use edgelake_core::{
    matcher::{extract_host, MatchDefinition, MatchIndex, Target},
    naming::{Deployment, FunctionConfig, NamingPath, Object, Source, Trigger},
    vm::{VmConfig, VmContext},
    Error, Result,
};
use monoio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    common::{Canceller, CancellerDropper, ReadyGate},
    context::NodeContext,
    messaging::MessagingMap,
    path::best_path,
    serviceable::{Handled, Outcome, Serviceable},
};

mod call;
mod metrics;
mod shadow;

pub use call::{CallService, CallSettings, Caller, Invocation};
pub use metrics::{FunctionMetrics, FunctionStats};
pub use shadow::{InstanceRecipe, PoolState, ShadowInstance, ShadowPool};

#[derive(Clone)]
pub struct Function(Arc<FunctionInner>);

struct FunctionInner {
    ctx: Arc<NodeContext>,
    matcher: MatchDefinition,
    deployment: Deployment,
    asset_id: String,
    config: FunctionConfig,
    messaging: MessagingMap,

    lifetime: Canceller,
    _lifetime_guard: CancellerDropper,
    gate: ReadyGate,
    provisioning: AtomicBool,
    pool: OnceLock<ShadowPool>,
    caller: OnceLock<Caller>,
    metrics: Arc<FunctionMetrics>,

    shutting_down: AtomicBool,
    shutdown_done: ReadyGate,
}

impl Function {
    pub fn new(
        ctx: Arc<NodeContext>,
        config: FunctionConfig,
        deployment: Deployment,
        asset_id: impl Into<String>,
        matcher: &MatchDefinition,
    ) -> Result<Self> {
        let messaging = match &config.trigger {
            Trigger::Pubsub { messaging } => MessagingMap::new(messaging)?,
            Trigger::Http { .. } => MessagingMap::default(),
        };
        let lifetime = ctx.lifetime.child();
        Ok(Self(Arc::new(FunctionInner {
            ctx,
            matcher: matcher.clone(),
            deployment,
            asset_id: asset_id.into(),
            config,
            messaging,
            _lifetime_guard: lifetime.clone().dropper(),
            lifetime,
            gate: ReadyGate::new(),
            provisioning: AtomicBool::new(false),
            pool: OnceLock::new(),
            caller: OnceLock::new(),
            metrics: Arc::new(FunctionMetrics::default()),
            shutting_down: AtomicBool::new(false),
            shutdown_done: ReadyGate::new(),
        })))
    }

    #[inline]
    pub fn deployment(&self) -> &Deployment {
        &self.0.deployment
    }

    #[inline]
    pub fn asset_id(&self) -> &str {
        &self.0.asset_id
    }

    #[inline]
    pub fn matcher(&self) -> &MatchDefinition {
        &self.0.matcher
    }

    pub fn config(&self) -> &FunctionConfig {
        &self.0.config
    }

    pub fn metrics(&self) -> FunctionStats {
        self.0.metrics.snapshot()
    }

    pub fn pool(&self) -> Option<&ShadowPool> {
        self.0.pool.get()
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn match_index(&self, matcher: &MatchDefinition) -> MatchIndex {
        match (matcher.target(), &self.0.config.trigger) {
            (
                Target::Http(target),
                Trigger::Http {
                    method,
                    domains,
                    paths,
                },
            ) => {
                if !method.eq_ignore_ascii_case(&target.method) {
                    return MatchIndex::NO_MATCH;
                }
                if !domains.is_empty() {
                    let host = extract_host(&target.host);
                    if !domains.iter().any(|d| extract_host(d) == host) {
                        return MatchIndex::NO_MATCH;
                    }
                }
                best_path(paths, &target.path).0
            }
            (Target::PubSub(target), Trigger::Pubsub { .. }) => {
                let d = &self.0.deployment;
                if target.project != d.project || target.application != d.application {
                    return MatchIndex::NO_MATCH;
                }
                match self.0.messaging.find(&target.channel) {
                    Some(_) => MatchIndex::HIGH_MATCH,
                    None => MatchIndex::NO_MATCH,
                }
            }
            _ => MatchIndex::NO_MATCH,
        }
    }

    pub async fn provision(&self) -> Result<Serviceable> {
        let canonical = self.0.ctx.cache()?.add(self.clone().into())?;
        if !matches!(&canonical, Serviceable::Function(f) if f.ptr_eq(self)) {
            debug!("function `{}` already cached, reusing it", self.deployment().id);
            return Ok(canonical);
        }
        if self.0.provisioning.swap(true, Ordering::AcqRel) {
            self.ready().await?;
            return Ok(canonical);
        }

        let _guard = self.0.gate.guard();
        let result = self.init().await.map_err(|e| Error::Provision {
            id: self.deployment().id.clone(),
            source: Box::new(e),
        });
        if let Err(e) = self.0.gate.finish(result) {
            warn!("provisioning function `{}` failed: {e}", self.deployment().id);
            if let Ok(cache) = self.0.ctx.cache() {
                cache.evict(&self.clone().into());
            }
            self.close();
            return Err(Error::NotReady(e));
        }
        info!("provisioned function `{}` ({})", self.0.config.name, self.deployment().id);
        Ok(canonical)
    }

    async fn init(&self) -> Result<()> {
        let inner = &self.0;
        let module = self.module_name().await?;
        let pool_config = &inner.ctx.config.pool;
        let timeout = inner
            .config
            .timeout_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or_else(|| pool_config.default_timeout());
        let factory = CallService::factory(module, &inner.config.call, inner.metrics.clone());
        let _ = inner.caller.set(Caller::new(CallSettings { timeout }, factory));

        let d = &inner.deployment;
        let recipe = InstanceRecipe {
            engine: inner.ctx.collaborators.engine.clone(),
            plugins: inner.ctx.collaborators.plugins.clone(),
            context: VmContext {
                project: d.project.clone(),
                application: d.application.clone(),
                resource: d.id.clone(),
                branch: d.branch.clone(),
                commit: d.commit.clone(),
            },
            config: VmConfig::with_memory(inner.config.memory.unwrap_or(pool_config.default_memory)),
        };
        let cache = inner.ctx.cache.clone();
        let this = Arc::downgrade(&self.0);
        let pool = ShadowPool::start(
            d.id.clone(),
            pool_config.clone(),
            recipe,
            inner.ctx.budget.clone(),
            inner.lifetime.waiter(),
            move || {
                if let (Some(cache), Some(inner)) = (cache.upgrade(), this.upgrade()) {
                    cache.evict(&Serviceable::Function(Function(inner)));
                }
            },
        );
        let _ = inner.pool.set(pool);
        Ok(())
    }

    async fn module_name(&self) -> Result<String> {
        let inner = &self.0;
        match &inner.config.source {
            Source::Inline => Ok(format!("asset/{}", inner.asset_id)),
            Source::Library(name) => {
                let path = NamingPath::library(&inner.deployment, name)?;
                match inner.ctx.naming().fetch(&path).await {
                    Ok(Object::Value(cid)) => Ok(format!("asset/{cid}")),
                    Ok(other) => Err(Error::Fetch {
                        path: path.to_string(),
                        source: anyhow::anyhow!("expected library asset, got {}", other.kind()),
                    }),
                    Err(source) => Err(Error::Fetch {
                        path: path.to_string(),
                        source,
                    }),
                }
            }
        }
    }

    pub async fn ready(&self) -> Result<()> {
        self.0.gate.wait().await.map_err(Error::NotReady)
    }

    pub fn is_provisioned(&self) -> bool {
        self.0.pool.get().is_some()
    }

    pub async fn handle(&self, _matcher: &MatchDefinition, event: u32) -> Result<Handled> {
        self.ready().await?;
        let (Some(pool), Some(caller)) = (self.0.pool.get(), self.0.caller.get()) else {
            return Err(Error::Closed);
        };

        let started = Instant::now();
        let (mut instance, cold) = pool.get().await?;
        if cold {
            self.0.metrics.record_cold_start(started.elapsed());
        }
        let code = caller.call(instance.runtime(), event).await?;
        Ok(Handled {
            started: started.into_std(),
            outcome: Outcome::Executed { code },
        })
    }

    /// Cancels the function's lifetime, which stops its pool.
    pub fn close(&self) {
        self.0.lifetime.cancel();
        self.0.gate.close(Err(Error::Closed));
    }

    /// Closes the function and waits for its pool to finish draining.
    /// Concurrent callers all wait for the same completion.
    pub async fn shutdown(&self) {
        if self.0.shutting_down.swap(true, Ordering::AcqRel) {
            let _ = self.0.shutdown_done.wait().await;
            return;
        }
        self.close();
        if let Some(pool) = self.0.pool.get() {
            pool.stopped().await;
        }
        self.0.shutdown_done.close(Ok(()));
    }
}
