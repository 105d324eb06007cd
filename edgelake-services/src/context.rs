use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
};

use edgelake_core::{
    asset::AssetStore, config::NodeConfig, domain::DomainValidator, naming::NamingService,
    vm::{Engine, Plugin},
    Error, Result,
};

use crate::{cache::Cache, common::Canceller};

/// External systems a node is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub naming: Arc<dyn NamingService>,
    pub assets: Arc<dyn AssetStore>,
    pub engine: Arc<dyn Engine>,
    pub domains: Arc<dyn DomainValidator>,
    pub plugins: Vec<Arc<dyn Plugin>>,
}

/// Shared state every serviceable of a node points back to.
pub struct NodeContext {
    pub(crate) collaborators: Collaborators,
    pub(crate) config: NodeConfig,
    pub(crate) cache: Weak<Cache>,
    pub(crate) lifetime: Canceller,
    pub(crate) budget: Arc<InstanceBudget>,
}

impl NodeContext {
    #[inline]
    pub fn naming(&self) -> &dyn NamingService {
        self.collaborators.naming.as_ref()
    }

    #[inline]
    pub fn assets(&self) -> &dyn AssetStore {
        self.collaborators.assets.as_ref()
    }

    #[inline]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn cache(&self) -> Result<Arc<Cache>> {
        self.cache.upgrade().ok_or(Error::Closed)
    }

    pub fn budget(&self) -> &InstanceBudget {
        &self.budget
    }
}

/// Node wide count of pooled instances.
#[derive(Debug)]
pub struct InstanceBudget {
    used: AtomicUsize,
    limit: usize,
}

impl InstanceBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
        }
    }

    /// Reserves one slot, released when the permit drops.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BudgetPermit> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .ok()
            .map(|_| BudgetPermit(self.clone()))
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[derive(Debug)]
pub struct BudgetPermit(Arc<InstanceBudget>);

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.0.used.fetch_sub(1, Ordering::AcqRel);
    }
}
