use std::time::Duration;

use monoio::time::timeout;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Param, Service,
};

#[derive(Debug, Clone, Copy)]
pub struct Timeout(pub Duration);

#[derive(thiserror::Error, Debug)]
pub enum TimeoutError<E> {
    #[error("deadline of {0:?} elapsed")]
    Elapsed(Duration),
    #[error(transparent)]
    Inner(E),
}

/// Bounds every call of the inner service by a fixed deadline.
#[derive(Clone)]
pub struct TimeoutService<T> {
    timeout: Duration,
    inner: T,
}

impl<R, T> Service<R> for TimeoutService<T>
where
    T: Service<R>,
{
    type Response = T::Response;
    type Error = TimeoutError<T::Error>;

    async fn call(&self, req: R) -> Result<Self::Response, Self::Error> {
        match timeout(self.timeout, self.inner.call(req)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(err)) => Err(TimeoutError::Inner(err)),
            Err(_) => Err(TimeoutError::Elapsed(self.timeout)),
        }
    }
}

impl<T> TimeoutService<T> {
    pub fn layer<C>() -> impl FactoryLayer<C, T, Factory = Self>
    where
        C: Param<Timeout>,
    {
        layer_fn(|c: &C, inner| TimeoutService {
            timeout: c.param().0,
            inner,
        })
    }
}

impl<F> MakeService for TimeoutService<F>
where
    F: MakeService,
{
    type Service = TimeoutService<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(TimeoutService {
            timeout: self.timeout,
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}
