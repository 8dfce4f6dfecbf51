use crate::activator::ServiceActivator;
use crate::context::ServerCallContext;
use crate::error::{Error, Result};
use crate::handler::{
    CallHandler, ClientStreamingServerCallHandler, DuplexStreamingServerCallHandler,
    ServerStreamingServerCallHandler, UnaryServerCallHandler,
};
use crate::interceptor::{InterceptorRegistration, RequestStream, ResponseWriter};
use crate::invoker::{
    ClientStreamingServerMethod, ClientStreamingServerMethodInvoker, DuplexStreamingServerMethod,
    DuplexStreamingServerMethodInvoker, ServerStreamingServerMethod,
    ServerStreamingServerMethodInvoker, UnaryServerMethod, UnaryServerMethodInvoker,
};
use crate::options::{MethodOptions, ServiceOptions};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use futures::future::BoxFuture;
use mqrpc_core::{Method, MethodDescriptor, Status};
use thiserror::Error;
use tracing::debug;

/// Why a lookup found no handler.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum LookupError {
    /// Nothing is registered for the service.
    #[error("Service '{0}' is unimplemented.")]
    UnknownService(String),

    /// The service exists but has no such method.
    #[error("Method '{method}' is unimplemented.")]
    UnknownMethod {
        /// Service name.
        service: String,
        /// Requested method name.
        method: String,
    },
}

impl From<LookupError> for Status {
    fn from(error: LookupError) -> Self {
        Self::not_found(error.to_string())
    }
}

/// Maps `(service, method)` pairs to call handlers.
///
/// Populated at startup, then shared read-only by the listener workers.
pub struct MethodRegistry {
    global_options: ServiceOptions,
    handlers: DashMap<(String, String), Arc<dyn CallHandler>>,
    services: DashSet<String>,
}

impl MethodRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(ServiceOptions::default())
    }

    /// Creates an empty registry with options applied to every service.
    #[must_use]
    pub fn with_options(global_options: ServiceOptions) -> Self {
        Self {
            global_options,
            handlers: DashMap::new(),
            services: DashSet::new(),
        }
    }

    /// Adds a global interceptor. It wraps methods of services bound afterwards.
    pub fn register_interceptor(&mut self, registration: InterceptorRegistration) {
        debug!("added interceptor {}", registration.type_name());
        self.global_options = std::mem::take(&mut self.global_options).with_interceptor(registration);
    }

    /// Registers a handler for a method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRegistration`] if the method is already registered.
    pub fn register(
        &self,
        descriptor: &MethodDescriptor,
        handler: Arc<dyn CallHandler>,
    ) -> Result<()> {
        let key = (
            descriptor.service_name().to_string(),
            descriptor.full_name().to_string(),
        );

        match self.handlers.entry(key) {
            Entry::Occupied(_) => Err(Error::DuplicateRegistration {
                service: descriptor.service_name().to_string(),
                method: descriptor.full_name().to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(handler);
                self.services.insert(descriptor.service_name().to_string());
                debug!(
                    "added {:?} method {}",
                    descriptor.kind(),
                    descriptor.full_name()
                );
                Ok(())
            }
        }
    }

    /// Finds the handler for a method.
    ///
    /// # Errors
    ///
    /// Returns a [`LookupError`] telling whether the service or only the
    /// method is unknown.
    pub fn lookup(
        &self,
        service: &str,
        method: &str,
    ) -> std::result::Result<Arc<dyn CallHandler>, LookupError> {
        if let Some(handler) = self
            .handlers
            .get(&(service.to_string(), method.to_string()))
        {
            return Ok(Arc::clone(handler.value()));
        }

        if self.services.contains(service) {
            Err(LookupError::UnknownMethod {
                service: service.to_string(),
                method: method.to_string(),
            })
        } else {
            Err(LookupError::UnknownService(service.to_string()))
        }
    }

    /// Starts binding the methods of a service.
    ///
    /// # Errors
    ///
    /// Returns an error if the global and service options do not resolve.
    pub fn bind_service<S>(
        &self,
        activator: Arc<dyn ServiceActivator<S>>,
        options: &ServiceOptions,
    ) -> Result<ServiceBinder<'_, S>>
    where
        S: Send + Sync + 'static,
    {
        let options = Arc::new(MethodOptions::create([&self.global_options, options])?);

        Ok(ServiceBinder {
            activator,
            options,
            registry: self,
        })
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no methods are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.handlers.len())
            .field("services", &self.services.len())
            .finish_non_exhaustive()
    }
}

/// Registers the methods of one service, sharing its activator and options.
pub struct ServiceBinder<'a, S> {
    activator: Arc<dyn ServiceActivator<S>>,
    options: Arc<MethodOptions>,
    registry: &'a MethodRegistry,
}

impl<S> ServiceBinder<'_, S>
where
    S: Send + Sync + 'static,
{
    /// Binds a unary method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRegistration`] if the method is already registered.
    pub fn add_unary<Req, Res, F, Fut>(&self, method: Method<Req, Res>, f: F) -> Result<&Self>
    where
        Req: Send + 'static,
        Res: Send + 'static,
        F: Fn(Arc<S>, Req, Arc<ServerCallContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<Res>, Status>> + Send + 'static,
    {
        let descriptor = method.descriptor().clone();
        let call: UnaryServerMethod<S, Req, Res> = Arc::new(
            move |service: Arc<S>,
                  request: Req,
                  context: Arc<ServerCallContext>|
                  -> BoxFuture<'static, _> { f(service, request, context).boxed() },
        );
        let invoker = UnaryServerMethodInvoker::new(
            call,
            method,
            Arc::clone(&self.options),
            Arc::clone(&self.activator),
        );

        self.registry
            .register(&descriptor, Arc::new(UnaryServerCallHandler::new(invoker)))?;
        Ok(self)
    }

    /// Binds a client streaming method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRegistration`] if the method is already registered.
    pub fn add_client_streaming<Req, Res, F, Fut>(
        &self,
        method: Method<Req, Res>,
        f: F,
    ) -> Result<&Self>
    where
        Req: Send + 'static,
        Res: Send + 'static,
        F: Fn(Arc<S>, RequestStream<Req>, Arc<ServerCallContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<Res>, Status>> + Send + 'static,
    {
        let descriptor = method.descriptor().clone();
        let call: ClientStreamingServerMethod<S, Req, Res> = Arc::new(
            move |service: Arc<S>,
                  requests: RequestStream<Req>,
                  context: Arc<ServerCallContext>|
                  -> BoxFuture<'static, _> { f(service, requests, context).boxed() },
        );
        let invoker = ClientStreamingServerMethodInvoker::new(
            call,
            method,
            Arc::clone(&self.options),
            Arc::clone(&self.activator),
        );

        self.registry.register(
            &descriptor,
            Arc::new(ClientStreamingServerCallHandler::new(invoker)),
        )?;
        Ok(self)
    }

    /// Binds a server streaming method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRegistration`] if the method is already registered.
    pub fn add_server_streaming<Req, Res, F, Fut>(
        &self,
        method: Method<Req, Res>,
        f: F,
    ) -> Result<&Self>
    where
        Req: Send + 'static,
        Res: Send + 'static,
        F: Fn(Arc<S>, Req, ResponseWriter<Res>, Arc<ServerCallContext>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = std::result::Result<(), Status>> + Send + 'static,
    {
        let descriptor = method.descriptor().clone();
        let call: ServerStreamingServerMethod<S, Req, Res> = Arc::new(
            move |service: Arc<S>,
                  request: Req,
                  responses: ResponseWriter<Res>,
                  context: Arc<ServerCallContext>|
                  -> BoxFuture<'static, _> {
                f(service, request, responses, context).boxed()
            },
        );
        let invoker = ServerStreamingServerMethodInvoker::new(
            call,
            method,
            Arc::clone(&self.options),
            Arc::clone(&self.activator),
        );

        self.registry.register(
            &descriptor,
            Arc::new(ServerStreamingServerCallHandler::new(invoker)),
        )?;
        Ok(self)
    }

    /// Binds a duplex streaming method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRegistration`] if the method is already registered.
    pub fn add_duplex_streaming<Req, Res, F, Fut>(
        &self,
        method: Method<Req, Res>,
        f: F,
    ) -> Result<&Self>
    where
        Req: Send + 'static,
        Res: Send + 'static,
        F: Fn(Arc<S>, RequestStream<Req>, ResponseWriter<Res>, Arc<ServerCallContext>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = std::result::Result<(), Status>> + Send + 'static,
    {
        let descriptor = method.descriptor().clone();
        let call: DuplexStreamingServerMethod<S, Req, Res> = Arc::new(
            move |service: Arc<S>,
                  requests: RequestStream<Req>,
                  responses: ResponseWriter<Res>,
                  context: Arc<ServerCallContext>|
                  -> BoxFuture<'static, _> {
                f(service, requests, responses, context).boxed()
            },
        );
        let invoker = DuplexStreamingServerMethodInvoker::new(
            call,
            method,
            Arc::clone(&self.options),
            Arc::clone(&self.activator),
        );

        self.registry.register(
            &descriptor,
            Arc::new(DuplexStreamingServerCallHandler::new(invoker)),
        )?;
        Ok(self)
    }
}

impl<S> fmt::Debug for ServiceBinder<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBinder")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
