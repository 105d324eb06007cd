use std::{collections::HashMap, fmt};

use parking_lot::Mutex;

use crate::util::hash::sha256;

const PATH_MATCH: &str = "path_match";

/// Transport a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Http,
    PubSub,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub host: String,
    pub path: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubTarget {
    pub project: String,
    pub application: String,
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Http(HttpTarget),
    PubSub(PubSubTarget),
}

/// Request fingerprint used to route to exactly one serviceable.
///
/// The target is immutable. The side-table is request scoped and written by
/// scoring, e.g. to remember which configured path prefix matched.
#[derive(Debug)]
pub struct MatchDefinition {
    target: Target,
    values: Mutex<HashMap<String, String>>,
}

impl MatchDefinition {
    pub fn http(
        host: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self::new(Target::Http(HttpTarget {
            host: host.into(),
            path: path.into(),
            method: method.into(),
        }))
    }

    pub fn pubsub(
        project: impl Into<String>,
        application: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self::new(Target::PubSub(PubSubTarget {
            project: project.into(),
            application: application.into(),
            channel: channel.into(),
        }))
    }

    pub fn new(target: Target) -> Self {
        Self {
            target,
            values: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn transport(&self) -> Transport {
        match self.target {
            Target::Http(_) => Transport::Http,
            Target::PubSub(_) => Transport::PubSub,
        }
    }

    pub fn as_http(&self) -> Option<&HttpTarget> {
        match &self.target {
            Target::Http(t) => Some(t),
            Target::PubSub(_) => None,
        }
    }

    pub fn as_pubsub(&self) -> Option<&PubSubTarget> {
        match &self.target {
            Target::PubSub(t) => Some(t),
            Target::Http(_) => None,
        }
    }

    /// Routing bucket key: the normalized host for HTTP, the project for pub-sub.
    pub fn cache_prefix(&self) -> String {
        match &self.target {
            Target::Http(t) => extract_host(&t.host),
            Target::PubSub(t) => t.project.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.lock().insert(key.into(), value.into());
    }

    /// Configured path prefix that matched for serviceable `id`.
    pub fn path_match(&self, id: &str) -> Option<String> {
        self.get(&path_match_key(id))
    }

    pub fn set_path_match(&self, id: &str, path: impl Into<String>) {
        self.set(path_match_key(id), path)
    }
}

impl Clone for MatchDefinition {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            values: Mutex::new(self.values.lock().clone()),
        }
    }
}

impl fmt::Display for MatchDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Http(t) => write!(f, "method `{}` on `https://{}{}`", t.method, t.host, t.path),
            Target::PubSub(t) => write!(
                f,
                "{}/{}",
                sha256(&format!("{}{}", t.project, t.application)),
                t.channel
            ),
        }
    }
}

fn path_match_key(id: &str) -> String {
    format!("{PATH_MATCH}/{id}")
}

/// Lowercased host with any port removed.
pub fn extract_host(host: &str) -> String {
    let host = host.trim();
    let bare = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port))
                if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
            {
                name
            }
            _ => host,
        }
    };
    bare.to_ascii_lowercase()
}
