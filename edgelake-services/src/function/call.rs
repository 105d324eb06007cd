use std::{convert::Infallible, sync::Arc, time::Duration};

use edgelake_core::{vm::Runtime, Error, Result};
use monoio::time::Instant;
use service_async::{stack::FactoryStack, MakeService, Param, Service};

use super::metrics::FunctionMetrics;
use crate::common::{Timeout, TimeoutError, TimeoutService};

/// One event delivered to a warm instance.
pub struct Invocation<'a> {
    pub runtime: &'a mut dyn Runtime,
    pub event: u32,
}

/// Runs the configured entry point of a resolved module.
pub struct CallService {
    module: String,
    entry: String,
    metrics: Arc<FunctionMetrics>,
}

impl<'a> Service<Invocation<'a>> for CallService {
    type Response = u32;
    type Error = Error;

    async fn call(&self, Invocation { runtime, event }: Invocation<'a>) -> Result<u32> {
        let exported = runtime
            .lookup(&self.module, &self.entry)
            .map_err(|source| Error::Call { event, source })?;
        if !exported {
            return Err(Error::ModuleNotFound {
                module: self.module.clone(),
                entry: self.entry.clone(),
            });
        }

        let start = Instant::now();
        let result = runtime.call(&self.module, &self.entry, event).await;
        if let Some(bytes) = runtime.memory_size(&self.module) {
            self.metrics.record_memory(bytes);
        }
        let code = result.map_err(|source| Error::Call { event, source })?;
        self.metrics.record_call(start.elapsed());
        Ok(code)
    }
}

impl CallService {
    pub fn factory(
        module: impl Into<String>,
        entry: impl Into<String>,
        metrics: Arc<FunctionMetrics>,
    ) -> CallServiceFactory {
        CallServiceFactory {
            module: module.into(),
            entry: entry.into(),
            metrics,
        }
    }
}

pub struct CallServiceFactory {
    module: String,
    entry: String,
    metrics: Arc<FunctionMetrics>,
}

impl MakeService for CallServiceFactory {
    type Service = CallService;
    type Error = Infallible;

    fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> std::result::Result<Self::Service, Self::Error> {
        Ok(CallService {
            module: self.module.clone(),
            entry: self.entry.clone(),
            metrics: self.metrics.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CallSettings {
    pub timeout: Duration,
}

impl Param<Timeout> for CallSettings {
    fn param(&self) -> Timeout {
        Timeout(self.timeout)
    }
}

/// Entry point call bounded by the function's deadline.
pub struct Caller {
    inner: TimeoutService<CallService>,
}

impl Caller {
    pub fn new(settings: CallSettings, factory: CallServiceFactory) -> Self {
        let stack = FactoryStack::new(settings)
            .replace(factory)
            .push(TimeoutService::layer())
            .into_inner();
        let inner = stack.make().unwrap_or_else(|e| match e {});
        Self { inner }
    }

    pub async fn call(&self, runtime: &mut dyn Runtime, event: u32) -> Result<u32> {
        match self.inner.call(Invocation { runtime, event }).await {
            Ok(code) => Ok(code),
            Err(TimeoutError::Inner(e)) => Err(e),
            Err(TimeoutError::Elapsed(timeout)) => Err(Error::Timeout { event, timeout }),
        }
    }
}
