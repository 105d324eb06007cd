//! Website serviceable: a zipped static site served from memory.
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, OnceLock,
};

use edgelake_core::{
    matcher::{extract_host, MatchDefinition, MatchIndex, Target},
    naming::{Deployment, WebsiteConfig},
    Error, Result,
};
use http::Method;
use monoio::time::Instant;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    common::{Canceller, CancellerDropper, ReadyGate},
    context::NodeContext,
    path::best_path,
    serviceable::{Handled, Outcome, Serviceable},
};

mod bundle;

pub use bundle::{clean_path, Bundle};
#[cfg(test)]
pub(crate) use bundle::zip_files;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WebsiteStats {
    /// The bundle was already held locally when provisioned.
    pub cached: bool,
    pub bytes_served: u64,
}

#[derive(Clone)]
pub struct Website(Arc<WebsiteInner>);

struct WebsiteInner {
    ctx: Arc<NodeContext>,
    matcher: MatchDefinition,
    deployment: Deployment,
    asset_id: String,
    config: WebsiteConfig,

    lifetime: Canceller,
    _lifetime_guard: CancellerDropper,
    gate: ReadyGate,
    provisioning: AtomicBool,
    bundle: OnceLock<Bundle>,

    cached: AtomicBool,
    bytes_served: AtomicU64,
}

fn accepts_method(method: &str) -> bool {
    method.is_empty()
        || method.eq_ignore_ascii_case(Method::GET.as_str())
        || method.eq_ignore_ascii_case(Method::HEAD.as_str())
}

impl Website {
    pub fn new(
        ctx: Arc<NodeContext>,
        config: WebsiteConfig,
        deployment: Deployment,
        asset_id: impl Into<String>,
        matcher: &MatchDefinition,
    ) -> Self {
        let lifetime = ctx.lifetime.child();
        Self(Arc::new(WebsiteInner {
            ctx,
            matcher: matcher.clone(),
            deployment,
            asset_id: asset_id.into(),
            config,
            _lifetime_guard: lifetime.clone().dropper(),
            lifetime,
            gate: ReadyGate::new(),
            provisioning: AtomicBool::new(false),
            bundle: OnceLock::new(),
            cached: AtomicBool::new(false),
            bytes_served: AtomicU64::new(0),
        }))
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

    pub fn config(&self) -> &WebsiteConfig {
        &self.0.config
    }

    pub fn bundle(&self) -> Option<&Bundle> {
        self.0.bundle.get()
    }

    pub fn metrics(&self) -> WebsiteStats {
        WebsiteStats {
            cached: self.0.cached.load(Ordering::Relaxed),
            bytes_served: self.0.bytes_served.load(Ordering::Relaxed),
        }
    }

    pub fn ptr_eq(&self, other: &Website) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Prefix matches are promoted to exact ones when the rest of the request
    /// path names a file in the bundle. Records the matched prefix on
    /// `matcher` for path rewriting.
    pub fn match_index(&self, matcher: &MatchDefinition) -> MatchIndex {
        let Target::Http(target) = matcher.target() else {
            return MatchIndex::NO_MATCH;
        };
        if !accepts_method(&target.method) {
            return MatchIndex::NO_MATCH;
        }
        let config = &self.0.config;
        if !config.domains.is_empty() {
            let host = extract_host(&target.host);
            if !config.domains.iter().any(|d| extract_host(d) == host) {
                return MatchIndex::NO_MATCH;
            }
        }

        let (mut score, pattern) = best_path(&config.paths, &target.path);
        let Some(pattern) = pattern else {
            return score;
        };
        if score >= MatchIndex::MIN_MATCH && !score.is_high() {
            if let Some(bundle) = self.0.bundle.get() {
                let rest = target
                    .path
                    .strip_prefix(pattern.trim_end_matches('/'))
                    .unwrap_or(&target.path);
                let rest = rest.trim_start_matches('/');
                if !rest.is_empty() && bundle.contains(rest) {
                    score = MatchIndex::HIGH_MATCH;
                }
            }
        }
        matcher.set_path_match(&self.0.deployment.id, pattern);
        score
    }

    pub async fn provision(&self) -> Result<Serviceable> {
        let canonical = self.0.ctx.cache()?.add(self.clone().into())?;
        if !matches!(&canonical, Serviceable::Website(w) if w.ptr_eq(self)) {
            debug!("website `{}` already cached, reusing it", self.deployment().id);
            return Ok(canonical);
        }
        if self.0.provisioning.swap(true, Ordering::AcqRel) {
            self.ready().await?;
            return Ok(canonical);
        }

        let _guard = self.0.gate.guard();
        let result = self.fetch_bundle().await.map_err(|e| Error::Provision {
            id: self.deployment().id.clone(),
            source: Box::new(e),
        });
        if let Err(e) = self.0.gate.finish(result) {
            warn!("provisioning website `{}` failed: {e}", self.deployment().id);
            if let Ok(cache) = self.0.ctx.cache() {
                cache.evict(&self.clone().into());
            }
            self.close();
            return Err(Error::NotReady(e));
        }
        info!("provisioned website `{}` ({})", self.0.config.name, self.deployment().id);
        Ok(canonical)
    }

    async fn fetch_bundle(&self) -> Result<()> {
        let inner = &self.0;
        let assets = inner.ctx.assets();
        let cid = inner.asset_id.as_str();
        inner
            .cached
            .store(assets.has_block(cid).await, Ordering::Relaxed);
        let asset_err = |source| Error::Asset {
            asset: cid.to_string(),
            source,
        };
        let data = assets.get(cid).await.map_err(asset_err)?;
        let bundle = Bundle::from_zip(data).map_err(asset_err)?;
        debug!("website `{}` bundle holds {} file(s)", inner.deployment.id, bundle.len());
        let _ = inner.bundle.set(bundle);
        Ok(())
    }

    pub async fn ready(&self) -> Result<()> {
        self.0.gate.wait().await.map_err(Error::NotReady)
    }

    pub fn is_provisioned(&self) -> bool {
        self.0.bundle.get().is_some()
    }

    pub async fn handle(&self, matcher: &MatchDefinition, _event: u32) -> Result<Handled> {
        self.ready().await?;
        let Some(bundle) = self.0.bundle.get() else {
            return Err(Error::Closed);
        };
        let Target::Http(target) = matcher.target() else {
            return Err(Error::Unsupported("websites only serve HTTP"));
        };

        let started = Instant::now();
        let prefix = matcher
            .path_match(&self.0.deployment.id)
            .unwrap_or_default();
        let prefix = prefix.trim_end_matches('/');
        let rest = target.path.strip_prefix(prefix).unwrap_or(&target.path);
        let mut path = clean_path(rest);
        if target.path.ends_with('/') && !path.ends_with('/') {
            path.push('/');
        }

        let head = target.method.eq_ignore_ascii_case(Method::HEAD.as_str());
        let resp = bundle.serve(&path, head);
        self.0
            .bytes_served
            .fetch_add(resp.body().len() as u64, Ordering::Relaxed);
        Ok(Handled {
            started: started.into_std(),
            outcome: Outcome::Served(resp),
        })
    }

    pub fn close(&self) {
        self.0.lifetime.cancel();
        self.0.gate.close(Err(Error::Closed));
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;

    use super::*;
    use crate::testing::{get, website_config, Harness, HOST};

    fn site() -> Bytes {
        zip_files(&[
            ("index.html", "<h1>home</h1>"),
            ("about/index.html", "<h1>about</h1>"),
        ])
    }

    fn served(handled: Handled) -> http::Response<Bytes> {
        match handled.outcome {
            Outcome::Served(resp) => resp,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_prefix_match_upgraded_by_bundle_index() {
        let h = Harness::new();
        h.assets.insert("Qmw1", site());
        let matcher = get("/portfolio/index.html");
        let w = h.website("w1", "c1", website_config(&["/portfolio"]), &matcher);

        let before = w.match_index(&matcher);
        assert!(before >= MatchIndex::MIN_MATCH && before < MatchIndex::HIGH_MATCH);
        assert_eq!(matcher.path_match("w1").as_deref(), Some("/portfolio"));

        w.provision().await.unwrap();
        assert_eq!(w.match_index(&matcher), MatchIndex::HIGH_MATCH);
        assert!(w.match_index(&get("/portfolio/missing.html")) < MatchIndex::HIGH_MATCH);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_only_read_methods() {
        let h = Harness::new();
        let w = h.website("w1", "c1", website_config(&["/"]), &get("/"));
        for method in ["", "GET", "head"] {
            let m = MatchDefinition::http(HOST, "/", method);
            assert_eq!(w.match_index(&m), MatchIndex::HIGH_MATCH);
        }
        let post = MatchDefinition::http(HOST, "/", "POST");
        assert_eq!(w.match_index(&post), MatchIndex::NO_MATCH);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_handle_rewrites_path() {
        let h = Harness::new();
        h.assets.insert("Qmw1", site());
        let matcher = get("/portfolio/about/");
        let w = h.website("w1", "c1", website_config(&["/portfolio"]), &matcher);
        w.match_index(&matcher);
        w.provision().await.unwrap();

        let resp = served(w.handle(&matcher, 0).await.unwrap());
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body().as_ref(), b"<h1>about</h1>");

        let deep = get("/portfolio/app/route");
        w.match_index(&deep);
        let resp = served(w.handle(&deep, 0).await.unwrap());
        assert_eq!(resp.body().as_ref(), b"<h1>home</h1>");

        let stats = w.metrics();
        assert!(stats.cached);
        assert_eq!(stats.bytes_served, 27);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_missing_asset_fails_readiness() {
        let h = Harness::new();
        let w = h.website("w1", "c1", website_config(&["/"]), &get("/"));
        let err = w.provision().await.unwrap_err();
        let Error::NotReady(cause) = err else {
            panic!("unexpected error {err}");
        };
        assert!(matches!(&*cause, Error::Provision { source, .. } if matches!(**source, Error::Asset { .. })));
        assert!(w.ready().await.is_err());
        assert!(!w.is_provisioned());
        assert!(h.node.cache().is_empty());

        // the next resolution starts over once the bundle is published
        h.assets.insert("Qmw1", site());
        let retry = h.website("w1", "c1", website_config(&["/"]), &get("/"));
        retry.provision().await.unwrap();
        assert!(retry.ready().await.is_ok());
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_concurrent_first_request_provisions_once() {
        let h = Harness::new();
        h.assets.insert("Qmw1", site());
        h.naming
            .publish_website(
                &crate::testing::deployment("w1", "c1"),
                website_config(&["/"]),
                "Qmw1",
                &[HOST.to_string()],
            )
            .unwrap();
        let matcher = get("/");
        let a = h.node.check_tns(&matcher).await.unwrap().remove(0);
        let b = h.node.check_tns(&matcher).await.unwrap().remove(0);
        assert!(!a.ptr_eq(&b));

        let (ra, rb) = futures_util::future::join(a.provision(), b.provision()).await;
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(ra.ptr_eq(&rb));
        rb.ready().await.unwrap();
        assert_eq!(h.assets.fetches(), 1);
        assert_eq!(h.node.cache().bucket_len(HOST), 1);
    }
}
