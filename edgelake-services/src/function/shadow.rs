//! Warm instance pool of a function.
//!
//! A single manager task per pool reacts to one trigger at a time: a refill
//! signal, a GC tick, an error cooldown tick or cancellation of the owning
//! function. Requests take instances from a bounded queue and fall back to
//! creating one inline when it is empty.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use edgelake_core::{
    config::PoolConfig,
    vm::{Engine, Plugin, Runtime, VmConfig, VmContext},
    Error, Result,
};
use futures_channel::mpsc;
use futures_util::{stream, StreamExt};
use monoio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::{
    common::{ReadyGate, Waiter},
    context::{BudgetPermit, InstanceBudget},
};

/// How to build one execution instance of a function.
pub struct InstanceRecipe {
    pub engine: Arc<dyn Engine>,
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub context: VmContext,
    pub config: VmConfig,
}

impl InstanceRecipe {
    pub async fn create(&self) -> Result<ShadowInstance> {
        let mut runtime = self
            .engine
            .instantiate(&self.context, self.config)
            .await
            .map_err(Error::Instantiate)?;
        for plugin in self.plugins.iter() {
            if let Err(e) = runtime.attach(plugin.as_ref()) {
                runtime.close();
                return Err(Error::Instantiate(
                    e.context(format!("attaching plugin `{}`", plugin.name())),
                ));
            }
        }
        Ok(ShadowInstance {
            runtime,
            created: Instant::now(),
            _permit: None,
        })
    }
}

/// A ready to run instance. Single use: it is closed when dropped.
pub struct ShadowInstance {
    runtime: Box<dyn Runtime>,
    created: Instant,
    _permit: Option<BudgetPermit>,
}

impl ShadowInstance {
    pub fn runtime(&mut self) -> &mut dyn Runtime {
        self.runtime.as_mut()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

impl Drop for ShadowInstance {
    fn drop(&mut self) {
        self.runtime.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Running = 0,
    /// Refill gave up after too many creation errors. Queued instances and
    /// inline creation keep serving until the pool is shut down.
    Halted = 1,
    Draining = 2,
    /// Shut down and drained.
    Stopped = 3,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PoolState::Running,
            1 => PoolState::Halted,
            2 => PoolState::Draining,
            _ => PoolState::Stopped,
        }
    }
}

struct PoolShared {
    name: String,
    config: PoolConfig,
    recipe: InstanceRecipe,
    budget: Arc<InstanceBudget>,
    tx: Sender<ShadowInstance>,
    rx: Receiver<ShadowInstance>,
    available: AtomicUsize,
    errors: AtomicU32,
    state: AtomicU8,
    refill_pending: AtomicBool,
    refill: mpsc::UnboundedSender<()>,
    exited: ReadyGate,
}

/// Handle to a running pool. Cheap to clone.
#[derive(Clone)]
pub struct ShadowPool {
    shared: Arc<PoolShared>,
}

impl ShadowPool {
    /// Spawns the manager task on the current thread. It runs until
    /// `lifetime` resolves, then drains the queue and calls `cleanup`.
    pub fn start<F>(
        name: impl Into<String>,
        config: PoolConfig,
        recipe: InstanceRecipe,
        budget: Arc<InstanceBudget>,
        lifetime: Waiter,
        cleanup: F,
    ) -> Self
    where
        F: FnOnce() + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(config.instance_max_requests);
        let (refill, signals) = mpsc::unbounded();
        let shared = Arc::new(PoolShared {
            name: name.into(),
            config,
            recipe,
            budget,
            tx,
            rx,
            available: AtomicUsize::new(0),
            errors: AtomicU32::new(0),
            state: AtomicU8::new(PoolState::Running as u8),
            refill_pending: AtomicBool::new(false),
            refill,
            exited: ReadyGate::new(),
        });
        info!("starting shadow pool for `{}`", shared.name);
        monoio::spawn(manage(shared.clone(), signals, lifetime, cleanup));
        shared.signal();
        Self { shared }
    }

    /// Takes a warm instance, or creates one inline when none is queued.
    /// The flag is true for an inline (cold) creation.
    pub async fn get(&self) -> Result<(ShadowInstance, bool)> {
        let shared = &self.shared;
        match shared.rx.try_recv() {
            Ok(mut instance) => {
                let _ = shared.available.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(1))
                });
                instance._permit = None;
                if shared.rx.len() < shared.config.shadow_min_buff.max(1) {
                    shared.signal();
                }
                Ok((instance, false))
            }
            Err(_) => {
                shared.signal();
                debug!("shadow pool for `{}` is empty, creating inline", shared.name);
                shared.recipe.create().await.map(|i| (i, true))
            }
        }
    }

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    pub fn queued(&self) -> usize {
        self.shared.rx.len()
    }

    pub fn available(&self) -> usize {
        self.shared.available.load(Ordering::Acquire)
    }

    pub fn errors(&self) -> u32 {
        self.shared.errors.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.instance_max_requests
    }

    /// Resolves once the manager task has exited and the queue is drained.
    pub async fn stopped(&self) {
        let _ = self.shared.exited.wait().await;
    }
}

impl PoolShared {
    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PoolState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Coalesces refill requests into at most one pending signal.
    fn signal(&self) {
        if self.state() != PoolState::Running {
            return;
        }
        if !self.refill_pending.swap(true, Ordering::AcqRel) {
            let _ = self.refill.unbounded_send(());
        }
    }

    fn error_ceiling_reached(&self) -> bool {
        self.errors.load(Ordering::Acquire) >= self.config.instance_max_error
    }

    async fn refill(&self) {
        if self.error_ceiling_reached() {
            self.stop_refill();
            return;
        }
        let room = self
            .config
            .instance_max_requests
            .saturating_sub(self.rx.len());
        let wanted = self.config.shadow_buff.min(room);
        if wanted == 0 {
            return;
        }

        let permits: Vec<BudgetPermit> =
            std::iter::from_fn(|| self.budget.try_acquire()).take(wanted).collect();
        if permits.len() < wanted {
            warn!(
                "instance budget exhausted ({}/{}), `{}` refills {} of {}",
                self.budget.used(),
                self.budget.limit(),
                self.name,
                permits.len(),
                wanted
            );
        }

        // Units that have not started yet are skipped once the ceiling is hit.
        let mut created = stream::iter(permits)
            .map(|permit| async move {
                if self.error_ceiling_reached() {
                    return None;
                }
                Some(self.recipe.create().await.map(|mut i| {
                    i._permit = Some(permit);
                    i
                }))
            })
            .buffer_unordered(self.config.refill_parallelism)
            .filter_map(std::future::ready);
        while let Some(result) = created.next().await {
            match result {
                Ok(instance) => match self.tx.try_send(instance) {
                    Ok(()) => {
                        self.available.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        debug!("shadow queue for `{}` is full", self.name);
                    }
                },
                Err(e) => {
                    let errors = self.errors.fetch_add(1, Ordering::AcqRel) + 1;
                    error!("creating shadow instance for `{}` failed ({errors}): {e}", self.name);
                }
            }
        }
        if self.error_ceiling_reached() {
            self.stop_refill();
        }
    }

    fn stop_refill(&self) {
        warn!(
            "shadow pool for `{}` reached {} creation errors, refill stopped",
            self.name, self.config.instance_max_error
        );
        self.set_state(PoolState::Halted);
    }

    fn cool_down(&self) {
        let _ = self
            .errors
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |e| Some(e / 2));
    }

    /// Keeps only instances younger than the max age.
    fn collect_garbage(&self) {
        let max_age = self.config.shadow_max_age();
        let survivors: Vec<ShadowInstance> =
            self.rx.try_iter().filter(|i| i.age() < max_age).collect();
        let mut kept = 0;
        for instance in survivors {
            if self.tx.try_send(instance).is_ok() {
                kept += 1;
            }
        }
        self.available.store(kept, Ordering::Release);
        debug!("shadow gc for `{}` kept {kept} instance(s)", self.name);
    }

    fn drain(&self) {
        let drained = self.rx.try_iter().count();
        self.available.store(0, Ordering::Release);
        debug!("drained {drained} shadow instance(s) of `{}`", self.name);
    }
}

async fn manage<F>(
    shared: Arc<PoolShared>,
    mut signals: mpsc::UnboundedReceiver<()>,
    mut lifetime: Waiter,
    cleanup: F,
) where
    F: FnOnce(),
{
    let config = &shared.config;
    let now = Instant::now();
    let mut gc = interval_at(now + config.shadow_gc_interval(), config.shadow_gc_interval());
    let mut cooldown = interval_at(now + config.error_cooldown(), config.error_cooldown());

    while shared.state() == PoolState::Running {
        monoio::select! {
            _ = &mut lifetime => break,
            _ = cooldown.tick() => shared.cool_down(),
            _ = gc.tick() => shared.collect_garbage(),
            signal = signals.next() => match signal {
                Some(()) => {
                    shared.refill().await;
                    shared.refill_pending.store(false, Ordering::Release);
                }
                None => break,
            },
        }
    }
    if shared.state() == PoolState::Halted {
        // queued instances stay usable until shutdown
        lifetime.await;
    }

    shared.set_state(PoolState::Draining);
    signals.close();
    shared.drain();
    shared.set_state(PoolState::Stopped);
    info!("shadow pool for `{}` stopped", shared.name);
    cleanup();
    shared.exited.close(Ok(()));
}
