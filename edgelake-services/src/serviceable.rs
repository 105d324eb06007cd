use std::{fmt, time::Instant};

use bytes::Bytes;
use edgelake_core::{
    matcher::{MatchDefinition, MatchIndex},
    naming::{Deployment, ResourceType},
    Error, Result,
};
use http::Response;

use crate::{function::Function, website::Website};

/// A resolved deployment bound to one commit and asset.
#[derive(Clone)]
pub enum Serviceable {
    Function(Function),
    Website(Website),
}

/// What handling a request produced.
#[derive(Debug)]
pub enum Outcome {
    Served(Response<Bytes>),
    Executed { code: u32 },
}

#[derive(Debug)]
pub struct Handled {
    /// When execution started, before any cold start.
    pub started: Instant,
    pub outcome: Outcome,
}

macro_rules! dispatch {
    ($self: expr, $s: ident => $body: expr) => {
        match $self {
            Serviceable::Function($s) => $body,
            Serviceable::Website($s) => $body,
        }
    };
}

impl Serviceable {
    pub fn kind(&self) -> ResourceType {
        match self {
            Serviceable::Function(_) => ResourceType::Function,
            Serviceable::Website(_) => ResourceType::Website,
        }
    }

    pub fn deployment(&self) -> &Deployment {
        dispatch!(self, s => s.deployment())
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.deployment().id
    }

    #[inline]
    pub fn project(&self) -> &str {
        &self.deployment().project
    }

    #[inline]
    pub fn commit(&self) -> &str {
        &self.deployment().commit
    }

    pub fn asset_id(&self) -> &str {
        dispatch!(self, s => s.asset_id())
    }

    /// The request this serviceable was resolved for.
    pub fn matcher(&self) -> &MatchDefinition {
        dispatch!(self, s => s.matcher())
    }

    pub fn match_index(&self, matcher: &MatchDefinition) -> MatchIndex {
        dispatch!(self, s => s.match_index(matcher))
    }

    pub fn validate(&self, matcher: &MatchDefinition) -> Result<()> {
        if self.match_index(matcher).is_match() {
            Ok(())
        } else {
            Err(Error::NoMatch(matcher.to_string()))
        }
    }

    /// Registers with the cache and runs one-time setup, unless another
    /// instance with the same id won the race; that one is returned instead.
    pub async fn provision(&self) -> Result<Serviceable> {
        dispatch!(self, s => s.provision().await)
    }

    pub async fn ready(&self) -> Result<()> {
        dispatch!(self, s => s.ready().await)
    }

    pub fn is_provisioned(&self) -> bool {
        dispatch!(self, s => s.is_provisioned())
    }

    pub async fn handle(&self, matcher: &MatchDefinition, event: u32) -> Result<Handled> {
        dispatch!(self, s => s.handle(matcher, event).await)
    }

    pub fn close(&self) {
        dispatch!(self, s => s.close())
    }

    /// Same allocation, not merely the same id.
    pub fn ptr_eq(&self, other: &Serviceable) -> bool {
        match (self, other) {
            (Serviceable::Function(a), Serviceable::Function(b)) => a.ptr_eq(b),
            (Serviceable::Website(a), Serviceable::Website(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<Function> for Serviceable {
    fn from(value: Function) -> Self {
        Serviceable::Function(value)
    }
}

impl From<Website> for Serviceable {
    fn from(value: Website) -> Self {
        Serviceable::Website(value)
    }
}

impl fmt::Debug for Serviceable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.deployment();
        f.debug_struct("Serviceable")
            .field("kind", &self.kind())
            .field("id", &d.id)
            .field("project", &d.project)
            .field("commit", &d.commit)
            .field("asset", &self.asset_id())
            .finish()
    }
}
