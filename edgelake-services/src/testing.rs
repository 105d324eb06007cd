use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use edgelake_core::{
    config::{NodeConfig, PoolConfig},
    matcher::MatchDefinition,
    naming::{Deployment, FunctionConfig, MessagingConfig, Source, Trigger, WebsiteConfig},
    vm::{Engine, Plugin, Runtime, VmConfig, VmContext},
    AnyResult,
};
use futures_util::future::{ready, FutureExt, LocalBoxFuture};
use parking_lot::Mutex;

use crate::{
    context::Collaborators,
    function::Function,
    memory::{AllowListDomains, MemoryAssets, MemoryNaming},
    node::Node,
    website::Website,
};

pub const HOST: &str = "hal.computers.com";
pub const PROJECT: &str = "p1";
pub const ENTRY_MISSING: &str = "missing";

#[derive(Default)]
struct ScriptState {
    created: AtomicUsize,
    closed: AtomicUsize,
    attached: AtomicUsize,
    fail: AtomicBool,
    call_delay_ms: AtomicU64,
    last_module: Mutex<Option<String>>,
}

/// Engine whose runtimes answer immediately with the event id as exit code.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    state: Arc<ScriptState>,
}

impl ScriptedEngine {
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn attached(&self) -> usize {
        self.state.attached.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.state.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_call_delay(&self, delay: Duration) {
        self.state
            .call_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn last_module(&self) -> Option<String> {
        self.state.last_module.lock().clone()
    }
}

impl Engine for ScriptedEngine {
    fn instantiate<'a>(
        &'a self,
        ctx: &'a VmContext,
        _config: VmConfig,
    ) -> LocalBoxFuture<'a, AnyResult<Box<dyn Runtime>>> {
        let result: AnyResult<Box<dyn Runtime>> = if self.state.fail.load(Ordering::SeqCst) {
            Err(anyhow::anyhow!("scripted failure for `{}`", ctx.resource))
        } else {
            self.state.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedRuntime {
                state: self.state.clone(),
            }))
        };
        ready(result).boxed_local()
    }
}

struct ScriptedRuntime {
    state: Arc<ScriptState>,
}

impl Runtime for ScriptedRuntime {
    fn attach(&mut self, _plugin: &dyn Plugin) -> AnyResult<()> {
        self.state.attached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn lookup(&mut self, module: &str, entry: &str) -> AnyResult<bool> {
        *self.state.last_module.lock() = Some(module.to_string());
        Ok(entry != ENTRY_MISSING)
    }

    fn call<'a>(
        &'a mut self,
        _module: &'a str,
        _entry: &'a str,
        event: u32,
    ) -> LocalBoxFuture<'a, AnyResult<u32>> {
        let delay = self.state.call_delay_ms.load(Ordering::SeqCst);
        async move {
            if delay > 0 {
                monoio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(event)
        }
        .boxed_local()
    }

    fn memory_size(&self, _module: &str) -> Option<u64> {
        Some(2 * 65_536)
    }

    fn close(&mut self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct NamedPlugin;

impl Plugin for NamedPlugin {
    fn name(&self) -> &str {
        "scripted-sdk"
    }
}

pub fn pool_config() -> PoolConfig {
    PoolConfig {
        shadow_buff: 2,
        instance_max_requests: 4,
        shadow_gc_interval_ms: 60_000,
        error_cooldown_ms: 60_000,
        ..Default::default()
    }
}

pub struct Harness {
    pub naming: Arc<MemoryNaming>,
    pub assets: Arc<MemoryAssets>,
    pub engine: ScriptedEngine,
    pub domains: Arc<AllowListDomains>,
    pub node: Node,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(AllowListDomains::allow_all())
    }

    pub fn with_domains(domains: AllowListDomains) -> Self {
        Self::build(domains)
    }

    fn build(domains: AllowListDomains) -> Self {
        let naming = Arc::new(MemoryNaming::default());
        let assets = Arc::new(MemoryAssets::default());
        let engine = ScriptedEngine::default();
        let domains = Arc::new(domains);
        let config = NodeConfig {
            pool: pool_config(),
            ..Default::default()
        };
        let node = Node::new(
            Collaborators {
                naming: naming.clone(),
                assets: assets.clone(),
                engine: Arc::new(engine.clone()),
                domains: domains.clone(),
                plugins: vec![Arc::new(NamedPlugin)],
            },
            config,
        )
        .unwrap();
        Self {
            naming,
            assets,
            engine,
            domains,
            node,
        }
    }

    pub fn function(
        &self,
        id: &str,
        commit: &str,
        config: FunctionConfig,
        matcher: &MatchDefinition,
    ) -> Function {
        Function::new(
            self.node.context().clone(),
            config,
            deployment(id, commit),
            format!("Qm{id}"),
            matcher,
        )
        .unwrap()
    }

    pub fn website(
        &self,
        id: &str,
        commit: &str,
        config: WebsiteConfig,
        matcher: &MatchDefinition,
    ) -> Website {
        Website::new(
            self.node.context().clone(),
            config,
            deployment(id, commit),
            format!("Qm{id}"),
            matcher,
        )
    }
}

pub fn deployment(id: &str, commit: &str) -> Deployment {
    Deployment {
        project: PROJECT.into(),
        application: String::new(),
        branch: "main".into(),
        commit: commit.into(),
        id: id.into(),
    }
}

pub fn http_function(method: &str, paths: &[&str]) -> FunctionConfig {
    FunctionConfig {
        name: "ping".into(),
        trigger: Trigger::Http {
            method: method.into(),
            domains: Vec::new(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
        },
        call: "ping".into(),
        source: Source::Inline,
        timeout_ms: None,
        memory: None,
    }
}

pub fn pubsub_function(channel: &str) -> FunctionConfig {
    FunctionConfig {
        name: "consume".into(),
        trigger: Trigger::Pubsub {
            messaging: vec![MessagingConfig {
                name: "m1".into(),
                pattern: channel.into(),
                regex: false,
            }],
        },
        call: "consume".into(),
        source: Source::Inline,
        timeout_ms: None,
        memory: None,
    }
}

pub fn website_config(paths: &[&str]) -> WebsiteConfig {
    WebsiteConfig {
        name: "site".into(),
        domains: Vec::new(),
        paths: paths.iter().map(|p| p.to_string()).collect(),
    }
}

pub fn get(path: &str) -> MatchDefinition {
    MatchDefinition::http(HOST, path, "GET")
}

pub fn zip_site() -> bytes::Bytes {
    crate::website::zip_files(&[("index.html", "<h1>home</h1>")])
}
