use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll},
};

use futures_channel::oneshot;
use futures_util::future::{FutureExt, Shared};
use parking_lot::Mutex;

struct CancelHandler {
    cancelled: AtomicBool,
    notify: Mutex<Option<oneshot::Sender<()>>>,
    signal: Shared<oneshot::Receiver<()>>,
    children: Mutex<Vec<Weak<CancelHandler>>>,
}

impl CancelHandler {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.notify.lock().take() {
            let _ = tx.send(());
        }
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.into_iter().filter_map(|c| c.upgrade()) {
            child.cancel();
        }
    }
}

/// Lifetime token. Cancelling it wakes every [`Waiter`] and cancels every
/// child derived with [`Canceller::child`]. Dropping the last handle counts
/// as cancellation for outstanding waiters.
#[derive(Clone)]
pub struct Canceller {
    handler: Arc<CancelHandler>,
}

impl Default for Canceller {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Canceller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canceller")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Canceller {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            handler: Arc::new(CancelHandler {
                cancelled: AtomicBool::new(false),
                notify: Mutex::new(Some(tx)),
                signal: rx.shared(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn waiter(&self) -> Waiter {
        Waiter {
            signal: self.handler.signal.clone(),
            handler: Arc::downgrade(&self.handler),
        }
    }

    /// Derives a token that is cancelled together with `self`.
    pub fn child(&self) -> Canceller {
        let child = Canceller::new();
        {
            let mut children = self.handler.children.lock();
            if !self.is_cancelled() {
                children.retain(|c| c.strong_count() > 0);
                children.push(Arc::downgrade(&child.handler));
                return child;
            }
        }
        child.cancel();
        child
    }

    pub fn cancel(&self) {
        self.handler.cancel();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.handler.cancelled.load(Ordering::Acquire)
    }

    pub const fn dropper(self) -> CancellerDropper {
        CancellerDropper(self)
    }
}

pub struct CancellerDropper(Canceller);

impl Drop for CancellerDropper {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Resolves once its [`Canceller`] is cancelled or gone.
#[derive(Clone)]
pub struct Waiter {
    signal: Shared<oneshot::Receiver<()>>,
    handler: Weak<CancelHandler>,
}

impl Waiter {
    pub fn cancelled(&self) -> bool {
        self.handler
            .upgrade()
            .map_or(true, |handler| handler.cancelled.load(Ordering::Acquire))
    }
}

impl Future for Waiter {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.signal).poll(cx).map(|_| ())
    }
}
