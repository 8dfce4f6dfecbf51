use crate::context::ServerCallContext;
use crate::error::{Error, Result};

use std::sync::Arc;

use async_trait::async_trait;

/// A service instance handed out for one call.
#[derive(Debug)]
pub struct ActivatorHandle<S> {
    created: bool,
    instance: Arc<S>,
}

impl<S> ActivatorHandle<S> {
    /// Wraps an instance. `created` marks instances the activator owns and
    /// must dispose of on release.
    pub const fn new(instance: Arc<S>, created: bool) -> Self {
        Self { created, instance }
    }

    /// The service instance.
    #[must_use]
    pub fn instance(&self) -> Arc<S> {
        Arc::clone(&self.instance)
    }

    /// Whether the activator created the instance for this call.
    #[must_use]
    pub const fn created(&self) -> bool {
        self.created
    }
}

/// Creates and releases service instances around each call.
#[async_trait]
pub trait ServiceActivator<S>: Send + Sync + 'static {
    /// Creates an instance for a call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActivationFailed`] if no instance can be produced.
    fn create(&self, context: &ServerCallContext) -> Result<ActivatorHandle<S>>;

    /// Releases an instance after the call, whatever its outcome.
    async fn release(&self, handle: ActivatorHandle<S>);
}

/// Shares one instance across all calls.
#[derive(Debug)]
pub struct SingletonActivator<S> {
    instance: Arc<S>,
}

impl<S> SingletonActivator<S> {
    /// Creates an activator around an existing instance.
    pub const fn new(instance: Arc<S>) -> Self {
        Self { instance }
    }
}

#[async_trait]
impl<S> ServiceActivator<S> for SingletonActivator<S>
where
    S: Send + Sync + 'static,
{
    fn create(&self, _context: &ServerCallContext) -> Result<ActivatorHandle<S>> {
        Ok(ActivatorHandle::new(Arc::clone(&self.instance), false))
    }

    async fn release(&self, _handle: ActivatorHandle<S>) {}
}

type ServiceFactory<S> = dyn Fn(&ServerCallContext) -> std::result::Result<S, String> + Send + Sync;

/// Builds a fresh instance for every call and drops it on release.
pub struct PerCallActivator<S> {
    factory: Box<ServiceFactory<S>>,
}

impl<S> PerCallActivator<S> {
    /// Creates an activator from a factory.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&ServerCallContext) -> std::result::Result<S, String> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }
}

impl<S: Default + 'static> Default for PerCallActivator<S> {
    fn default() -> Self {
        Self::new(|_| Ok(S::default()))
    }
}

#[async_trait]
impl<S> ServiceActivator<S> for PerCallActivator<S>
where
    S: Send + Sync + 'static,
{
    fn create(&self, context: &ServerCallContext) -> Result<ActivatorHandle<S>> {
        let instance = (self.factory)(context).map_err(Error::ActivationFailed)?;
        Ok(ActivatorHandle::new(Arc::new(instance), true))
    }

    async fn release(&self, handle: ActivatorHandle<S>) {
        drop(handle);
    }
}
