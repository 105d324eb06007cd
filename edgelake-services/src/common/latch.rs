use std::sync::{Arc, OnceLock};

use edgelake_core::Error;

use super::cancel::Canceller;

/// Single-fire gate holding the outcome of a one-time setup.
///
/// Any number of tasks may [`wait`](ReadyGate::wait); the first
/// [`close`](ReadyGate::close) stores the result and releases them all.
#[derive(Debug)]
pub struct ReadyGate {
    result: OnceLock<Result<(), Arc<Error>>>,
    canceller: Canceller,
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyGate {
    pub fn new() -> Self {
        Self {
            result: OnceLock::new(),
            canceller: Canceller::new(),
        }
    }

    /// Stores `result` and wakes waiters. Returns false if already closed.
    pub fn close(&self, result: Result<(), Error>) -> bool {
        let stored = self.result.set(result.map_err(Arc::new)).is_ok();
        self.canceller.cancel();
        stored
    }

    /// Closes with `result` and returns whatever the gate ended up holding.
    pub fn finish(&self, result: Result<(), Error>) -> Result<(), Arc<Error>> {
        self.close(result);
        self.result
            .get()
            .cloned()
            .unwrap_or_else(|| Err(Arc::new(Error::Closed)))
    }

    pub fn is_closed(&self) -> bool {
        self.result.get().is_some()
    }

    pub async fn wait(&self) -> Result<(), Arc<Error>> {
        if let Some(result) = self.result.get() {
            return result.clone();
        }
        self.canceller.waiter().await;
        self.result
            .get()
            .cloned()
            .unwrap_or_else(|| Err(Arc::new(Error::Closed)))
    }

    /// Closes the gate with `Error::Closed` on drop unless it was closed by then.
    pub fn guard(&self) -> GateGuard<'_> {
        GateGuard(self)
    }
}

pub struct GateGuard<'a>(&'a ReadyGate);

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if !self.0.is_closed() {
            self.0.close(Err(Error::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{rc::Rc, time::Duration};

    use super::*;

    #[monoio::test(timer_enabled = true)]
    async fn test_waiters_see_first_result() {
        let gate = Rc::new(ReadyGate::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                monoio::spawn(async move { gate.wait().await })
            })
            .collect();
        monoio::time::sleep(Duration::from_millis(5)).await;

        assert!(gate.close(Ok(())));
        assert!(!gate.close(Err(Error::Closed)));
        for w in waiters {
            assert!(w.await.is_ok());
        }
        assert!(gate.wait().await.is_ok());
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_guard_closes_on_early_return() {
        let gate = ReadyGate::new();
        let setup = || -> Result<(), Error> {
            let _guard = gate.guard();
            Err(Error::Unsupported("setup"))
        };
        assert!(setup().is_err());
        assert!(gate.is_closed());
        let err = gate.wait().await.unwrap_err();
        assert!(matches!(*err, Error::Closed));
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_guard_keeps_stored_error() {
        let gate = ReadyGate::new();
        {
            let _guard = gate.guard();
            gate.close(Err(Error::NoMatch("x".into())));
        }
        let err = gate.wait().await.unwrap_err();
        assert!(matches!(*err, Error::NoMatch(_)));
    }
}
