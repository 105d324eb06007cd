//! Request resolution.
//!
//! A [`Node`] turns a [`MatchDefinition`] into exactly one serviceable: from
//! the cache when a fresh exact entry exists, otherwise by asking the naming
//! service for candidates and scoring them.
use std::sync::Arc;

use edgelake_core::{
    config::{CacheConfig, NodeConfig},
    domain::DEV_DOMAIN_PUBLIC_KEY,
    matcher::{extract_host, MatchDefinition, MatchIndex, Target},
    naming::{Deployment, NamingPath, Object, ResourceType},
    util::file_read_sync,
    Error, Result,
};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    cache::{Cache, GetOptions},
    common::Canceller,
    context::{Collaborators, InstanceBudget, NodeContext},
    function::Function,
    serviceable::{Handled, Serviceable},
    website::Website,
};

pub struct Node {
    ctx: Arc<NodeContext>,
    cache: Arc<Cache>,
    generated_domain: Regex,
    domain_key: Vec<u8>,
}

impl Node {
    pub fn new(collaborators: Collaborators, config: NodeConfig) -> Result<Self> {
        config.pool.validate()?;
        let resolver = &config.resolver;
        let generated_domain = Regex::new(&resolver.generated_domain_regex)
            .map_err(|e| Error::Config(format!("generated_domain_regex: {e}")))?;
        let domain_key = match (&resolver.domain_public_key, resolver.dev) {
            (Some(path), false) => file_read_sync(path).map_err(|e| {
                Error::Config(format!("reading domain key {}: {e}", path.display()))
            })?,
            _ => DEV_DOMAIN_PUBLIC_KEY.to_vec(),
        };

        let cache = Arc::new(Cache::new(
            collaborators.naming.clone(),
            CacheConfig::from(resolver),
        ));
        let ctx = Arc::new(NodeContext {
            budget: Arc::new(InstanceBudget::new(config.pool.max_global_instances)),
            collaborators,
            config,
            cache: Arc::downgrade(&cache),
            lifetime: Canceller::new(),
        });
        Ok(Self {
            ctx,
            cache,
            generated_domain,
            domain_key,
        })
    }

    #[inline]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    #[inline]
    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Resolves `matcher` through the naming service, ignoring the cache.
    pub async fn check_tns(&self, matcher: &MatchDefinition) -> Result<Vec<Serviceable>> {
        let mut candidates = Vec::new();
        match matcher.target() {
            Target::Http(target) => {
                let host = extract_host(&target.host);
                for &rtype in ResourceType::valid_for(matcher.transport()) {
                    let key = NamingPath::http_links(&host, rtype)?;
                    self.collect_candidates(&key, rtype, matcher, &mut candidates)
                        .await;
                }
            }
            Target::PubSub(target) => {
                let key = NamingPath::pubsub_links(&target.project, &target.application)?;
                self.collect_candidates(&key, ResourceType::Function, matcher, &mut candidates)
                    .await;
            }
        }

        let Some(pick) = get_pick(matcher, candidates) else {
            return Err(Error::NoMatch(matcher.to_string()));
        };
        if let Target::Http(target) = matcher.target() {
            self.validate_domain(pick.project(), &target.host).await?;
        }
        Ok(vec![pick])
    }

    async fn collect_candidates(
        &self,
        key: &NamingPath,
        rtype: ResourceType,
        matcher: &MatchDefinition,
        out: &mut Vec<Serviceable>,
    ) {
        let links = match self.ctx.naming().fetch(key).await {
            Ok(Object::Links(links)) => links,
            Ok(other) => {
                warn!("`{key}` holds {} instead of links", other.kind());
                return;
            }
            Err(e) => {
                debug!("no links at `{key}`: {e}");
                return;
            }
        };
        let Some(paths) = links.current(&self.ctx.config.resolver.default_branches) else {
            return;
        };
        for path in paths {
            match self.build(path, rtype, matcher).await {
                Ok(serviceable) => out.push(serviceable),
                Err(e) => debug!("skipping candidate `{path}`: {e}"),
            }
        }
    }

    async fn build(
        &self,
        path: &NamingPath,
        rtype: ResourceType,
        matcher: &MatchDefinition,
    ) -> Result<Serviceable> {
        let (deployment, path_type) = Deployment::from_path(path)?;
        if path_type != rtype {
            return Err(Error::InvalidPath(format!("`{path}` is not a {rtype} path")));
        }
        let config = self.fetch(path).await?;
        let asset_path = NamingPath::asset(&deployment.project, &deployment.id)?;
        let asset_id = match self.fetch(&asset_path).await? {
            Object::Value(cid) => cid,
            other => {
                return Err(Error::Fetch {
                    path: asset_path.to_string(),
                    source: anyhow::anyhow!("expected a content address, got {}", other.kind()),
                })
            }
        };

        let ctx = self.ctx.clone();
        match config {
            Object::Function(config) => {
                Function::new(ctx, config, deployment, asset_id, matcher).map(Into::into)
            }
            Object::Website(config) => {
                Ok(Website::new(ctx, config, deployment, asset_id, matcher).into())
            }
            other => Err(Error::Fetch {
                path: path.to_string(),
                source: anyhow::anyhow!("expected a {rtype} config, got {}", other.kind()),
            }),
        }
    }

    async fn fetch(&self, path: &NamingPath) -> Result<Object> {
        self.ctx
            .naming()
            .fetch(path)
            .await
            .map_err(|source| Error::Fetch {
                path: path.to_string(),
                source,
            })
    }

    async fn validate_domain(&self, project: &str, host: &str) -> Result<()> {
        let host = extract_host(host);
        if self.generated_domain.is_match(&host) {
            return Ok(());
        }
        self.ctx
            .collaborators
            .domains
            .validate(project, &host, &self.domain_key)
            .await
            .map_err(|source| Error::Domain { host, source })
    }

    /// Resolves `matcher` to exactly one serviceable. Duplicates are purged
    /// from the cache and resolution is retried once.
    pub async fn lookup(&self, matcher: &MatchDefinition) -> Result<Serviceable> {
        if self.ctx.lifetime.is_cancelled() {
            return Err(Error::Closed);
        }
        let found = match self.cache.get(matcher, &GetOptions::validated()).await {
            Ok(found) => found,
            Err(_) => self.check_tns(matcher).await?,
        };
        if let Some(one) = exactly_one(&found) {
            return Ok(one);
        }

        warn!(
            "{} serviceables resolved for {matcher}, purging and retrying",
            found.len()
        );
        for serviceable in found.iter() {
            self.cache.remove(serviceable);
        }
        let retried = self.check_tns(matcher).await?;
        exactly_one(&retried).ok_or_else(|| Error::Ambiguous {
            matcher: matcher.to_string(),
            count: retried.len(),
        })
    }

    /// Full request path: resolve, provision, wait until ready, handle.
    pub async fn serve(&self, matcher: &MatchDefinition, event: u32) -> Result<Handled> {
        let serviceable = self.lookup(matcher).await?.provision().await?;
        serviceable.ready().await?;
        serviceable.handle(matcher, event).await
    }

    /// Cancels every serviceable of the node and empties the cache.
    pub fn shutdown(&self) {
        info!("shutting down node with {} cached serviceable(s)", self.cache.len());
        self.ctx.lifetime.cancel();
        self.cache.close();
    }
}

fn exactly_one(found: &[Serviceable]) -> Option<Serviceable> {
    match found {
        [one] => Some(one.clone()),
        _ => None,
    }
}

/// Best candidate for `matcher`. The first exact match wins outright,
/// otherwise the first of the highest scores above the default.
pub fn get_pick(
    matcher: &MatchDefinition,
    candidates: impl IntoIterator<Item = Serviceable>,
) -> Option<Serviceable> {
    let mut current = MatchIndex::DEFAULT_MATCH;
    let mut pick = None;
    for candidate in candidates {
        let score = candidate.match_index(matcher);
        if score.is_high() {
            return Some(candidate);
        }
        if score > current {
            current = score;
            pick = Some(candidate);
        }
    }
    pick
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        function::PoolState,
        memory::AllowListDomains,
        serviceable::Outcome,
        testing::{
            deployment, get, http_function, pubsub_function, website_config, zip_site, Harness,
            HOST, PROJECT,
        },
    };

    fn publish_ping(h: &Harness) {
        h.naming
            .publish_function(
                &deployment("f1", "c1"),
                http_function("GET", &["/ping"]),
                "Qmf1",
                &[HOST.to_string()],
            )
            .unwrap();
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_check_tns_exact_http_match() {
        let h = Harness::new();
        publish_ping(&h);

        let found = h.node.check_tns(&get("/ping")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), "f1");
        assert_eq!(found[0].kind(), ResourceType::Function);
        assert_eq!(found[0].asset_id(), "Qmf1");

        let err = h.node.check_tns(&get("/ping2")).await.unwrap_err();
        assert!(matches!(err, Error::NoMatch(_)));
        let post = MatchDefinition::http(HOST, "/ping", "POST");
        assert!(h.node.check_tns(&post).await.is_err());
        // resolution does not populate the cache
        assert!(h.node.cache().is_empty());
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_check_tns_ignores_port_and_case() {
        let h = Harness::new();
        publish_ping(&h);
        let m = MatchDefinition::http("HAL.computers.com:8443", "/ping", "GET");
        assert_eq!(h.node.check_tns(&m).await.unwrap().len(), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_get_pick() {
        let h = Harness::new();
        let matcher = get("/api/v1/users");
        let root: Serviceable = h
            .website("w1", "c1", website_config(&["/"]), &matcher)
            .into();
        let short: Serviceable = h
            .function("f1", "c1", http_function("GET", &["/api"]), &matcher)
            .into();
        let long: Serviceable = h
            .function("f2", "c1", http_function("GET", &["/api/v1"]), &matcher)
            .into();
        let other: Serviceable = h
            .function("f3", "c1", http_function("GET", &["/other"]), &matcher)
            .into();

        let pick = get_pick(&matcher, [root.clone(), short.clone(), long.clone()]).unwrap();
        assert!(pick.ptr_eq(&long));
        let pick = get_pick(&matcher, [root.clone(), other.clone()]).unwrap();
        assert!(pick.ptr_eq(&root));
        assert!(get_pick(&matcher, [other.clone()]).is_none());

        let exact = get("/api");
        let a: Serviceable = h
            .function("f4", "c1", http_function("GET", &["/api"]), &exact)
            .into();
        let b: Serviceable = h
            .function("f5", "c1", http_function("GET", &["/api"]), &exact)
            .into();
        assert!(get_pick(&exact, [a.clone(), b]).unwrap().ptr_eq(&a));
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_lookup_purges_duplicates() {
        let h = Harness::new();
        publish_ping(&h);
        let matcher = get("/ping");
        let cache = h.node.cache();
        let stale: Vec<Serviceable> = ["f1", "f9"]
            .into_iter()
            .map(|id| {
                h.function(id, "c1", http_function("GET", &["/ping"]), &matcher)
                    .into()
            })
            .collect();
        for s in stale.iter() {
            cache.add(s.clone()).unwrap();
        }
        assert_eq!(cache.bucket_len(HOST), 2);

        let picked = h.node.lookup(&matcher).await.unwrap();
        assert_eq!(picked.id(), "f1");
        assert!(!stale.iter().any(|s| s.ptr_eq(&picked)));
        assert_eq!(cache.bucket_len(HOST), 0);
        for s in stale.iter() {
            assert!(s.ready().await.is_err());
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_lookup_prefers_fresh_cache_entry() {
        let h = Harness::new();
        publish_ping(&h);
        let matcher = get("/ping");
        let cached = h.node.lookup(&matcher).await.unwrap().provision().await.unwrap();

        let again = h.node.lookup(&matcher).await.unwrap();
        assert!(again.ptr_eq(&cached));

        // a new commit makes the cached entry stale
        h.naming
            .publish_function(
                &deployment("f1", "c2"),
                http_function("GET", &["/ping"]),
                "Qmf1b",
                &[HOST.to_string()],
            )
            .unwrap();
        let fresh = h.node.lookup(&matcher).await.unwrap();
        assert!(!fresh.ptr_eq(&cached));
        assert_eq!(fresh.commit(), "c2");
        assert_eq!(fresh.asset_id(), "Qmf1b");
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_domain_ownership_required() {
        let h = Harness::with_domains(AllowListDomains::default());
        publish_ping(&h);
        let err = h.node.check_tns(&get("/ping")).await.unwrap_err();
        assert!(matches!(err, Error::Domain { .. }));

        h.domains.allow(PROJECT, HOST);
        assert!(h.node.check_tns(&get("/ping")).await.is_ok());
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_generated_domains_skip_ownership() {
        let h = Harness::with_domains(AllowListDomains::default());
        let host = "abc123.g.edgelake.link";
        h.naming
            .publish_function(
                &deployment("f1", "c1"),
                http_function("GET", &["/ping"]),
                "Qmf1",
                &[host.to_string()],
            )
            .unwrap();
        let m = MatchDefinition::http(host, "/ping", "GET");
        assert_eq!(h.node.check_tns(&m).await.unwrap().len(), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_pubsub_resolution() {
        let h = Harness::new();
        h.naming
            .publish_function(&deployment("f1", "c1"), pubsub_function("orders"), "Qmf1", &[])
            .unwrap();
        let m = MatchDefinition::pubsub(PROJECT, "", "orders");
        let found = h.node.check_tns(&m).await.unwrap();
        assert_eq!(found[0].id(), "f1");

        let other = MatchDefinition::pubsub(PROJECT, "", "payments");
        assert!(matches!(
            h.node.check_tns(&other).await,
            Err(Error::NoMatch(_))
        ));
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_serve_function_and_website() {
        let h = Harness::new();
        publish_ping(&h);
        h.naming
            .publish_website(
                &deployment("w1", "c1"),
                website_config(&["/"]),
                "Qmw1",
                &[HOST.to_string()],
            )
            .unwrap();
        h.assets.insert("Qmw1", zip_site());

        let handled = h.node.serve(&get("/ping"), 3).await.unwrap();
        assert!(matches!(handled.outcome, Outcome::Executed { code: 3 }));

        let handled = h.node.serve(&get("/index.html"), 0).await.unwrap();
        let Outcome::Served(resp) = handled.outcome else {
            panic!("website should serve");
        };
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(h.node.cache().bucket_len(HOST), 2);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_failed_provision_recovers_on_next_request() {
        let h = Harness::new();
        let mut config = http_function("GET", &["/ping"]);
        config.source = edgelake_core::naming::Source::Library("shared".into());
        let d = deployment("f1", "c1");
        h.naming
            .publish_function(&d, config, "Qmf1", &[HOST.to_string()])
            .unwrap();

        let err = h.node.serve(&get("/ping"), 1).await.unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
        assert!(h.node.cache().is_empty());

        let library = NamingPath::library(&d, "shared").unwrap();
        h.naming.insert(&library, Object::Value("Qmlib".into()));
        let handled = h.node.serve(&get("/ping"), 5).await.unwrap();
        assert!(matches!(handled.outcome, Outcome::Executed { code: 5 }));
        assert_eq!(h.engine.last_module().as_deref(), Some("asset/Qmlib"));
        assert_eq!(h.node.cache().bucket_len(HOST), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_shutdown_stops_pools() {
        let h = Harness::new();
        publish_ping(&h);
        let s = h.node.lookup(&get("/ping")).await.unwrap().provision().await.unwrap();
        monoio::time::sleep(Duration::from_millis(10)).await;
        let Serviceable::Function(f) = &s else {
            panic!("expected a function");
        };
        let pool = f.pool().unwrap().clone();

        h.node.shutdown();
        pool.stopped().await;
        assert_eq!(pool.state(), PoolState::Stopped);
        assert!(h.node.cache().is_empty());
        assert!(matches!(
            h.node.serve(&get("/ping"), 1).await,
            Err(Error::Closed)
        ));
    }
}
