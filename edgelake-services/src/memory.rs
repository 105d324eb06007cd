//! In-memory collaborators, for tests and for running a node from a manifest.
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::anyhow;
use bytes::Bytes;
use edgelake_core::{
    asset::AssetStore,
    domain::DomainValidator,
    naming::{
        Deployment, FunctionConfig, LinkIndex, NamingPath, NamingService, Object, ResourceType,
        Trigger, WebsiteConfig,
    },
    vm::{Engine, Runtime, VmConfig, VmContext},
    AnyResult,
};
use futures_util::future::{ready, FutureExt, LocalBoxFuture};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Deployments to publish into a [`MemoryNaming`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub deployments: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(flatten)]
    pub deployment: Deployment,
    /// Content address of the module or bundle.
    pub asset: String,
    /// Hosts the deployment is linked under; unused for pub-sub functions.
    #[serde(default)]
    pub hosts: Vec<String>,
    pub resource: Resource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    Function(FunctionConfig),
    Website(WebsiteConfig),
}

#[derive(Debug, Default)]
pub struct MemoryNaming {
    objects: RwLock<HashMap<String, Object>>,
    commits: RwLock<HashMap<(String, String), String>>,
}

impl MemoryNaming {
    pub fn from_manifest(manifest: &Manifest) -> AnyResult<Self> {
        let naming = Self::default();
        for entry in manifest.deployments.iter() {
            match &entry.resource {
                Resource::Function(config) => naming.publish_function(
                    &entry.deployment,
                    config.clone(),
                    &entry.asset,
                    &entry.hosts,
                )?,
                Resource::Website(config) => naming.publish_website(
                    &entry.deployment,
                    config.clone(),
                    &entry.asset,
                    &entry.hosts,
                )?,
            };
        }
        Ok(naming)
    }

    pub fn insert(&self, path: &NamingPath, object: Object) {
        self.objects.write().insert(path.to_string(), object);
    }

    pub fn set_commit(&self, project: &str, branch: &str, commit: &str) {
        self.commits
            .write()
            .insert((project.to_string(), branch.to_string()), commit.to_string());
    }

    fn link(&self, key: &NamingPath, branch: &str, path: &NamingPath) {
        let mut objects = self.objects.write();
        let entry = objects
            .entry(key.to_string())
            .or_insert_with(|| Object::Links(LinkIndex::default()));
        if let Object::Links(links) = entry {
            links.push(branch, path.clone());
        }
    }

    fn publish(
        &self,
        deployment: &Deployment,
        rtype: ResourceType,
        object: Object,
        asset: &str,
        links: &[NamingPath],
    ) -> AnyResult<NamingPath> {
        let path = NamingPath::deployment(deployment, rtype)?;
        self.insert(&path, object);
        self.insert(
            &NamingPath::asset(&deployment.project, &deployment.id)?,
            Object::Value(asset.to_string()),
        );
        for key in links {
            self.link(key, &deployment.branch, &path);
        }
        self.set_commit(&deployment.project, &deployment.branch, &deployment.commit);
        Ok(path)
    }

    pub fn publish_function(
        &self,
        deployment: &Deployment,
        config: FunctionConfig,
        asset: &str,
        hosts: &[String],
    ) -> AnyResult<NamingPath> {
        let links = match &config.trigger {
            Trigger::Http { .. } => hosts
                .iter()
                .map(|h| NamingPath::http_links(h, ResourceType::Function))
                .collect::<Result<Vec<_>, _>>()?,
            Trigger::Pubsub { .. } => vec![NamingPath::pubsub_links(
                &deployment.project,
                &deployment.application,
            )?],
        };
        self.publish(
            deployment,
            ResourceType::Function,
            Object::Function(config),
            asset,
            &links,
        )
    }

    pub fn publish_website(
        &self,
        deployment: &Deployment,
        config: WebsiteConfig,
        asset: &str,
        hosts: &[String],
    ) -> AnyResult<NamingPath> {
        let links = hosts
            .iter()
            .map(|h| NamingPath::http_links(h, ResourceType::Website))
            .collect::<Result<Vec<_>, _>>()?;
        self.publish(
            deployment,
            ResourceType::Website,
            Object::Website(config),
            asset,
            &links,
        )
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NamingService for MemoryNaming {
    fn fetch<'a>(&'a self, path: &'a NamingPath) -> LocalBoxFuture<'a, AnyResult<Object>> {
        let found = self
            .objects
            .read()
            .get(&path.to_string())
            .cloned()
            .ok_or_else(|| anyhow!("`{path}` not found"));
        ready(found).boxed_local()
    }

    fn commit<'a>(
        &'a self,
        project: &'a str,
        branches: &'a [String],
    ) -> LocalBoxFuture<'a, AnyResult<(String, String)>> {
        let commits = self.commits.read();
        let found = branches
            .iter()
            .find_map(|b| {
                commits
                    .get(&(project.to_string(), b.clone()))
                    .map(|c| (c.clone(), b.clone()))
            })
            .ok_or_else(|| anyhow!("project `{project}` has no commit on {branches:?}"));
        ready(found).boxed_local()
    }
}

#[derive(Debug, Default)]
pub struct MemoryAssets {
    blobs: RwLock<HashMap<String, Bytes>>,
    fetches: AtomicUsize,
}

impl MemoryAssets {
    /// Loads every file of `dir`, addressed by its file name.
    pub fn from_dir(dir: impl AsRef<Path>) -> AnyResult<Self> {
        let assets = Self::default();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            assets.insert(name, std::fs::read(entry.path())?);
        }
        Ok(assets)
    }

    pub fn insert(&self, cid: impl Into<String>, data: impl Into<Bytes>) {
        self.blobs.write().insert(cid.into(), data.into());
    }

    /// Number of `get` calls served so far.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AssetStore for MemoryAssets {
    fn get<'a>(&'a self, cid: &'a str) -> LocalBoxFuture<'a, AnyResult<Bytes>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let found = self
            .blobs
            .read()
            .get(cid)
            .cloned()
            .ok_or_else(|| anyhow!("asset `{cid}` not found"));
        ready(found).boxed_local()
    }

    fn has_block<'a>(&'a self, cid: &'a str) -> LocalBoxFuture<'a, bool> {
        ready(self.blobs.read().contains_key(cid)).boxed_local()
    }
}

/// Accepts `(project, host)` pairs registered up front.
#[derive(Debug, Default)]
pub struct AllowListDomains {
    allowed: RwLock<HashSet<(String, String)>>,
    allow_all: bool,
}

impl AllowListDomains {
    pub fn allow_all() -> Self {
        Self {
            allowed: RwLock::default(),
            allow_all: true,
        }
    }

    pub fn allow(&self, project: &str, host: &str) {
        self.allowed
            .write()
            .insert((project.to_string(), host.to_ascii_lowercase()));
    }
}

impl DomainValidator for AllowListDomains {
    fn validate<'a>(
        &'a self,
        project: &'a str,
        host: &'a str,
        _public_key: &'a [u8],
    ) -> LocalBoxFuture<'a, AnyResult<()>> {
        let allowed = self.allow_all
            || self
                .allowed
                .read()
                .contains(&(project.to_string(), host.to_string()));
        let result = if allowed {
            Ok(())
        } else {
            Err(anyhow!("`{host}` is not registered to project `{project}`"))
        };
        ready(result).boxed_local()
    }
}

/// Engine for nodes built without an execution backend.
#[derive(Debug, Default)]
pub struct NullEngine;

impl Engine for NullEngine {
    fn instantiate<'a>(
        &'a self,
        ctx: &'a VmContext,
        _config: VmConfig,
    ) -> LocalBoxFuture<'a, AnyResult<Box<dyn Runtime>>> {
        ready(Err(anyhow!(
            "no execution engine linked, cannot run `{}`",
            ctx.resource
        )))
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
        [[deployments]]
        project = "p1"
        branch = "main"
        commit = "c1"
        id = "f1"
        asset = "Qmfunction"
        hosts = ["hal.computers.com"]

        [deployments.resource]
        kind = "function"
        name = "ping"
        call = "ping"
        trigger = { type = "http", method = "GET", paths = ["/ping"] }

        [[deployments]]
        project = "p1"
        branch = "main"
        commit = "c1"
        id = "w1"
        asset = "Qmsite"
        hosts = ["hal.computers.com"]

        [deployments.resource]
        kind = "website"
        name = "site"
        paths = ["/"]
    "#;

    #[monoio::test(timer_enabled = true)]
    async fn test_manifest_publishes_links_assets_and_commits() {
        let manifest: Manifest = toml::from_str(MANIFEST).unwrap();
        let naming = MemoryNaming::from_manifest(&manifest).unwrap();

        let key = NamingPath::http_links("hal.computers.com", ResourceType::Function).unwrap();
        let Object::Links(links) = naming.fetch(&key).await.unwrap() else {
            panic!("expected links");
        };
        let paths = links.current(&["main".to_string()]).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(matches!(
            naming.fetch(&paths[0]).await.unwrap(),
            Object::Function(_)
        ));

        let asset = NamingPath::asset("p1", "w1").unwrap();
        assert_eq!(
            naming.fetch(&asset).await.unwrap(),
            Object::Value("Qmsite".into())
        );

        let branches = vec!["dev".to_string(), "main".to_string()];
        assert_eq!(
            naming.commit("p1", &branches).await.unwrap(),
            ("c1".to_string(), "main".to_string())
        );
        assert!(naming.commit("p2", &branches).await.is_err());
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_allow_list() {
        let domains = AllowListDomains::default();
        domains.allow("p1", "Example.com");
        assert!(domains.validate("p1", "example.com", b"").await.is_ok());
        assert!(domains.validate("p2", "example.com", b"").await.is_err());
        assert!(AllowListDomains::allow_all()
            .validate("p2", "example.com", b"")
            .await
            .is_ok());
    }
}
