//! Naming/discovery service seam.
//!
//! The naming service is the system of record for deployments. This module
//! only fixes how keys are laid out and what comes back; storage is external.
use std::{collections::HashMap, fmt, str::FromStr};

use futures_util::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    matcher::Transport,
    util::hash::sha256_joined,
    AnyResult, Error, Result,
};

/// Kind of deployable a naming path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Website,
    Function,
}

impl ResourceType {
    pub const fn path_variable(self) -> &'static str {
        match self {
            ResourceType::Website => "websites",
            ResourceType::Function => "functions",
        }
    }

    /// Resource types that can serve a request on `transport`, in lookup order.
    pub fn valid_for(transport: Transport) -> &'static [ResourceType] {
        match transport {
            Transport::Http => &[ResourceType::Website, ResourceType::Function],
            Transport::PubSub => &[ResourceType::Function],
        }
    }

    fn from_path_variable(s: &str) -> Option<Self> {
        match s {
            "websites" => Some(ResourceType::Website),
            "functions" => Some(ResourceType::Function),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_variable())
    }
}

/// Slash separated key into the naming service.
/// Position of the commit in `projects/<p>/branches/<b>/commit/<c>/...`.
const COMMIT_SEGMENT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamingPath(Vec<String>);

impl NamingPath {
    fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(Error::InvalidPath("empty path".into()));
        }
        for s in segments.iter() {
            if s.is_empty() || s.contains('/') {
                return Err(Error::InvalidPath(format!(
                    "invalid segment `{s}` in `{}`",
                    segments.join("/")
                )));
            }
        }
        Ok(Self(segments))
    }

    /// Link index of every `rtype` deployment bound to `host`.
    pub fn http_links(host: &str, rtype: ResourceType) -> Result<Self> {
        if host.is_empty() {
            return Err(Error::InvalidPath("empty host".into()));
        }
        let mut segments = vec!["http".to_string()];
        segments.extend(host.split('.').rev().map(str::to_string));
        segments.push(rtype.path_variable().to_string());
        segments.push("links".to_string());
        Self::from_segments(segments)
    }

    /// Link index of functions listening on pub-sub channels of an application.
    pub fn pubsub_links(project: &str, application: &str) -> Result<Self> {
        let application = if application.is_empty() { "_" } else { application };
        Self::from_segments(["pubsub", project, application, "functions", "links"])
    }

    pub fn deployment(deployment: &Deployment, rtype: ResourceType) -> Result<Self> {
        let mut segments = Self::commit_root(deployment);
        if !deployment.application.is_empty() {
            segments.push("applications".into());
            segments.push(deployment.application.clone());
        }
        segments.push(rtype.path_variable().into());
        segments.push(deployment.id.clone());
        Self::from_segments(segments)
    }

    /// Content address of the artifact built for `resource` in `project`.
    pub fn asset(project: &str, resource: &str) -> Result<Self> {
        Self::from_segments(["assets".to_string(), sha256_joined(&[project, resource])])
    }

    pub fn library(deployment: &Deployment, name: &str) -> Result<Self> {
        let mut segments = Self::commit_root(deployment);
        segments.push("libraries".into());
        segments.push(name.into());
        Self::from_segments(segments)
    }

    fn commit_root(deployment: &Deployment) -> Vec<String> {
        vec![
            "projects".into(),
            deployment.project.clone(),
            "branches".into(),
            deployment.branch.clone(),
            "commit".into(),
            deployment.commit.clone(),
        ]
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Equal up to the commit segment of a deployment path.
    fn same_deployment(&self, other: &NamingPath) -> bool {
        self.0.len() == other.0.len()
            && self.0.first().is_some_and(|s| s == "projects")
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .enumerate()
                .all(|(i, (a, b))| i == COMMIT_SEGMENT || a == b)
    }
}

impl fmt::Display for NamingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl FromStr for NamingPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_segments(s.trim_matches('/').split('/'))
    }
}

impl TryFrom<String> for NamingPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<NamingPath> for String {
    fn from(value: NamingPath) -> Self {
        value.to_string()
    }
}

/// Identity and version pin of a deployed resource, carried by its naming path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Deployment {
    pub project: String,
    #[serde(default)]
    pub application: String,
    pub branch: String,
    pub commit: String,
    pub id: String,
}

impl Deployment {
    /// Parses `projects/<p>/branches/<b>/commit/<c>[/applications/<a>]/<type>/<id>`.
    pub fn from_path(path: &NamingPath) -> Result<(Self, ResourceType)> {
        let invalid = || Error::InvalidPath(format!("`{path}` is not a deployment path"));
        let s: Vec<&str> = path.segments().iter().map(String::as_str).collect();
        let (application, rest) = match s.as_slice() {
            ["projects", _, "branches", _, "commit", _, "applications", app, rest @ ..] => {
                (app.to_string(), rest)
            }
            ["projects", _, "branches", _, "commit", _, rest @ ..] => (String::new(), rest),
            _ => return Err(invalid()),
        };
        let (rtype, id) = match rest {
            [rtype, id] => (ResourceType::from_path_variable(rtype).ok_or_else(invalid)?, id),
            _ => return Err(invalid()),
        };
        Ok((
            Deployment {
                project: s[1].to_string(),
                application,
                branch: s[3].to_string(),
                commit: s[5].to_string(),
                id: id.to_string(),
            },
            rtype,
        ))
    }
}

/// Branch → deployment paths touching one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkIndex(HashMap<String, Vec<NamingPath>>);

impl LinkIndex {
    /// Links `path` under `branch`, replacing the path of the same deployment
    /// at an earlier commit.
    pub fn push(&mut self, branch: impl Into<String>, path: NamingPath) {
        let paths = self.0.entry(branch.into()).or_default();
        match paths.iter_mut().find(|p| p.same_deployment(&path)) {
            Some(existing) => *existing = path,
            None => paths.push(path),
        }
    }

    /// Paths of the first branch in `branches` that has any.
    pub fn current(&self, branches: &[String]) -> Option<&[NamingPath]> {
        branches
            .iter()
            .find_map(|b| self.0.get(b).filter(|p| !p.is_empty()))
            .map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// The function's own asset is the module.
    Inline,
    /// A shared library resource of the same commit provides the module.
    Library(String),
}

impl Default for Source {
    fn default() -> Self {
        Self::Inline
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingConfig {
    pub name: String,
    #[serde(rename = "match")]
    pub pattern: String,
    #[serde(default)]
    pub regex: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Http {
        method: String,
        /// Fully qualified hosts; empty accepts any host routed here.
        #[serde(default)]
        domains: Vec<String>,
        paths: Vec<String>,
    },
    Pubsub {
        messaging: Vec<MessagingConfig>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub name: String,
    pub trigger: Trigger,
    /// Entry point called for every event.
    pub call: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Memory ceiling in bytes.
    #[serde(default)]
    pub memory: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsiteConfig {
    pub name: String,
    #[serde(default)]
    pub domains: Vec<String>,
    pub paths: Vec<String>,
}

/// Decoded value stored under a naming path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Object {
    Links(LinkIndex),
    Function(FunctionConfig),
    Website(WebsiteConfig),
    /// Raw scalar such as a content address.
    Value(String),
}

impl Object {
    pub fn kind(&self) -> &'static str {
        match self {
            Object::Links(_) => "links",
            Object::Function(_) => "function",
            Object::Website(_) => "website",
            Object::Value(_) => "value",
        }
    }
}

pub trait NamingService: Send + Sync {
    fn fetch<'a>(&'a self, path: &'a NamingPath) -> LocalBoxFuture<'a, AnyResult<Object>>;

    /// Current `(commit, branch)` of `project` on the first of `branches` that has one.
    fn commit<'a>(
        &'a self,
        project: &'a str,
        branches: &'a [String],
    ) -> LocalBoxFuture<'a, AnyResult<(String, String)>>;
}
