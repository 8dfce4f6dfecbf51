//! Interceptors and their registrations.
//!
//! Interceptors see requests and responses type erased as [`AnyMessage`] so a
//! single registration can wrap methods with different message types.
//! Downcast with [`Any::downcast_ref`] to inspect a specific message.

use crate::context::ServerCallContext;
use crate::error::{Error, Result};

use std::any::{Any, type_name};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use mqrpc_core::Status;

/// A request or response with its concrete type erased.
pub type AnyMessage = Box<dyn Any + Send>;

/// Stream of incoming requests for client and duplex streaming calls.
pub type RequestStream<T> = BoxStream<'static, std::result::Result<T, Status>>;

/// Continuation for unary calls.
pub type UnaryContinuation = Arc<
    dyn Fn(
            AnyMessage,
            Arc<ServerCallContext>,
        ) -> BoxFuture<'static, std::result::Result<Option<AnyMessage>, Status>>
        + Send
        + Sync,
>;

/// Continuation for client streaming calls.
pub type ClientStreamingContinuation = Arc<
    dyn Fn(
            RequestStream<AnyMessage>,
            Arc<ServerCallContext>,
        ) -> BoxFuture<'static, std::result::Result<Option<AnyMessage>, Status>>
        + Send
        + Sync,
>;

/// Continuation for server streaming calls.
pub type ServerStreamingContinuation = Arc<
    dyn Fn(
            AnyMessage,
            ResponseWriter<AnyMessage>,
            Arc<ServerCallContext>,
        ) -> BoxFuture<'static, std::result::Result<(), Status>>
        + Send
        + Sync,
>;

/// Continuation for duplex streaming calls.
pub type DuplexStreamingContinuation = Arc<
    dyn Fn(
            RequestStream<AnyMessage>,
            ResponseWriter<AnyMessage>,
            Arc<ServerCallContext>,
        ) -> BoxFuture<'static, std::result::Result<(), Status>>
        + Send
        + Sync,
>;

type WriteFn<T> = dyn Fn(T) -> BoxFuture<'static, std::result::Result<(), Status>> + Send + Sync;

/// Writes responses of a streaming call.
pub struct ResponseWriter<T> {
    sink: Arc<WriteFn<T>>,
}

impl<T: Send + 'static> ResponseWriter<T> {
    /// Creates a writer from an async sink function.
    pub fn new<F, Fut>(sink: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Status>> + Send + 'static,
    {
        Self {
            sink: Arc::new(move |message| -> BoxFuture<'static, _> { Box::pin(sink(message)) }),
        }
    }

    /// Creates a writer that forwards into a channel.
    #[must_use]
    pub fn from_channel(sender: flume::Sender<T>) -> Self {
        Self::new(move |message| {
            let sender = sender.clone();
            async move {
                sender
                    .send_async(message)
                    .await
                    .map_err(|_| Status::cancelled("Response stream closed."))
            }
        })
    }

    /// Writes one response.
    ///
    /// # Errors
    ///
    /// Returns a status if the stream is closed.
    pub async fn write(&self, message: T) -> std::result::Result<(), Status> {
        (self.sink)(message).await
    }

    pub(crate) fn erase(self) -> ResponseWriter<AnyMessage> {
        ResponseWriter::new(move |message: AnyMessage| {
            let inner = self.clone();
            async move { inner.write(downcast::<T>(message)?).await }
        })
    }
}

impl ResponseWriter<AnyMessage> {
    pub(crate) fn typed<T: Send + 'static>(self) -> ResponseWriter<T> {
        ResponseWriter::new(move |message: T| {
            let inner = self.clone();
            async move { inner.write(Box::new(message)).await }
        })
    }
}

impl<T> Clone for ResponseWriter<T> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
        }
    }
}

impl<T> fmt::Debug for ResponseWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseWriter<{}>", type_name::<T>())
    }
}

/// Recovers a concrete message from an [`AnyMessage`].
///
/// # Errors
///
/// Returns an `Internal` status if the message is of another type, which
/// means an interceptor swapped it for something the method cannot accept.
pub fn downcast<T: 'static>(message: AnyMessage) -> std::result::Result<T, Status> {
    message.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
        Status::internal(format!(
            "Interceptor produced a message that is not a {}.",
            type_name::<T>()
        ))
    })
}

/// Middleware wrapped around method invocations.
///
/// Every handler defaults to calling `next` unchanged, so implementations only
/// override the call kinds they care about.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Intercepts a unary call.
    async fn unary_server_handler(
        &self,
        request: AnyMessage,
        context: Arc<ServerCallContext>,
        next: UnaryContinuation,
    ) -> std::result::Result<Option<AnyMessage>, Status> {
        next(request, context).await
    }

    /// Intercepts a client streaming call.
    async fn client_streaming_server_handler(
        &self,
        requests: RequestStream<AnyMessage>,
        context: Arc<ServerCallContext>,
        next: ClientStreamingContinuation,
    ) -> std::result::Result<Option<AnyMessage>, Status> {
        next(requests, context).await
    }

    /// Intercepts a server streaming call.
    async fn server_streaming_server_handler(
        &self,
        request: AnyMessage,
        responses: ResponseWriter<AnyMessage>,
        context: Arc<ServerCallContext>,
        next: ServerStreamingContinuation,
    ) -> std::result::Result<(), Status> {
        next(request, responses, context).await
    }

    /// Intercepts a duplex streaming call.
    async fn duplex_streaming_server_handler(
        &self,
        requests: RequestStream<AnyMessage>,
        responses: ResponseWriter<AnyMessage>,
        context: Arc<ServerCallContext>,
        next: DuplexStreamingContinuation,
    ) -> std::result::Result<(), Status> {
        next(requests, responses, context).await
    }
}

/// An interceptor instance handed out for one call.
pub struct InterceptorHandle {
    created: bool,
    instance: Arc<dyn Interceptor>,
}

impl InterceptorHandle {
    /// Wraps an instance. `created` marks instances built for this call.
    #[must_use]
    pub const fn new(instance: Arc<dyn Interceptor>, created: bool) -> Self {
        Self { created, instance }
    }

    /// The interceptor.
    #[must_use]
    pub const fn instance(&self) -> &Arc<dyn Interceptor> {
        &self.instance
    }

    /// Whether the instance was built for this call.
    #[must_use]
    pub const fn created(&self) -> bool {
        self.created
    }
}

impl fmt::Debug for InterceptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorHandle")
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

/// Creates and releases interceptor instances around each call.
#[async_trait]
pub trait InterceptorActivator: Send + Sync + 'static {
    /// Creates an instance for a call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InterceptorConstructionFailed`] if construction fails.
    fn create(
        &self,
        context: &ServerCallContext,
        registration: &InterceptorRegistration,
    ) -> Result<InterceptorHandle>;

    /// Releases an instance after the call, whatever its outcome.
    async fn release(&self, handle: InterceptorHandle);
}

/// Builds an instance per call from the registration's factory.
#[derive(Debug, Default)]
pub struct DefaultInterceptorActivator;

#[async_trait]
impl InterceptorActivator for DefaultInterceptorActivator {
    fn create(
        &self,
        context: &ServerCallContext,
        registration: &InterceptorRegistration,
    ) -> Result<InterceptorHandle> {
        let instance = (registration.factory())(context)?;
        Ok(InterceptorHandle::new(instance, true))
    }

    async fn release(&self, handle: InterceptorHandle) {
        drop(handle);
    }
}

/// Hands out the registration's single shared instance.
#[derive(Debug, Default)]
pub struct SharedInterceptorActivator;

#[async_trait]
impl InterceptorActivator for SharedInterceptorActivator {
    fn create(
        &self,
        context: &ServerCallContext,
        registration: &InterceptorRegistration,
    ) -> Result<InterceptorHandle> {
        let instance = (registration.factory())(context)?;
        Ok(InterceptorHandle::new(instance, false))
    }

    async fn release(&self, _handle: InterceptorHandle) {}
}

/// Builds interceptor instances for a call.
pub type InterceptorFactory =
    Arc<dyn Fn(&ServerCallContext) -> Result<Arc<dyn Interceptor>> + Send + Sync>;

type Constructor =
    dyn Fn() -> std::result::Result<Arc<dyn Interceptor>, String> + Send + Sync;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifetime {
    PerCall,
    Shared,
}

/// An interceptor type plus how to build it.
///
/// The activator and factory are resolved on first use and cached. The caches
/// are filled without locking: two calls racing on first use may both build
/// a factory and one copy is dropped. Building is pure, so the race is
/// harmless.
pub struct InterceptorRegistration {
    activator: OnceLock<Arc<dyn InterceptorActivator>>,
    constructor: Arc<Constructor>,
    custom_activator: Option<Arc<dyn InterceptorActivator>>,
    factory: OnceLock<InterceptorFactory>,
    lifetime: Lifetime,
    type_name: &'static str,
}

impl InterceptorRegistration {
    /// Registers an interceptor built fresh for every call.
    ///
    /// The constructor captures whatever arguments the interceptor needs.
    pub fn new<I, F>(constructor: F) -> Self
    where
        I: Interceptor,
        F: Fn() -> std::result::Result<I, String> + Send + Sync + 'static,
    {
        Self::with_lifetime(
            type_name::<I>(),
            Lifetime::PerCall,
            Arc::new(move || constructor().map(|i| Arc::new(i) as Arc<dyn Interceptor>)),
        )
    }

    /// Registers one interceptor instance shared by every call.
    pub fn shared<I: Interceptor>(instance: Arc<I>) -> Self {
        Self::with_lifetime(
            type_name::<I>(),
            Lifetime::Shared,
            Arc::new(move || Ok::<_, String>(Arc::clone(&instance) as Arc<dyn Interceptor>)),
        )
    }

    fn with_lifetime(
        type_name: &'static str,
        lifetime: Lifetime,
        constructor: Arc<Constructor>,
    ) -> Self {
        Self {
            activator: OnceLock::new(),
            constructor,
            custom_activator: None,
            factory: OnceLock::new(),
            lifetime,
            type_name,
        }
    }

    /// Uses a custom activator instead of the default for the lifetime.
    #[must_use]
    pub fn with_activator(mut self, activator: Arc<dyn InterceptorActivator>) -> Self {
        self.custom_activator = Some(activator);
        self
    }

    /// Type name of the interceptor, for diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The activator, resolved on first use.
    pub fn activator(&self) -> Arc<dyn InterceptorActivator> {
        if let Some(activator) = self.activator.get() {
            return Arc::clone(activator);
        }

        let resolved = self.custom_activator.clone().unwrap_or_else(|| match self.lifetime {
            Lifetime::PerCall => Arc::new(DefaultInterceptorActivator),
            Lifetime::Shared => Arc::new(SharedInterceptorActivator),
        });
        let _ = self.activator.set(Arc::clone(&resolved));

        self.activator.get().map_or(resolved, Arc::clone)
    }

    /// The factory, built on first use.
    pub fn factory(&self) -> InterceptorFactory {
        if let Some(factory) = self.factory.get() {
            return Arc::clone(factory);
        }

        let constructor = Arc::clone(&self.constructor);
        let type_name = self.type_name;
        let built: InterceptorFactory = Arc::new(move |_context: &ServerCallContext| {
            constructor().map_err(|reason| {
                Error::InterceptorConstructionFailed(format!("{type_name}: {reason}"))
            })
        });
        let _ = self.factory.set(Arc::clone(&built));

        self.factory.get().map_or(built, Arc::clone)
    }
}

impl fmt::Debug for InterceptorRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorRegistration")
            .field("type_name", &self.type_name)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::MethodOptions;

    use mqrpc_core::{MethodDescriptor, MethodKind};
    use tokio_util::sync::CancellationToken;

    struct Noop;

    impl Interceptor for Noop {}

    fn context() -> ServerCallContext {
        ServerCallContext::new(
            MethodDescriptor::new(MethodKind::Unary, "Greet", "SayHello"),
            Arc::new(MethodOptions::default()),
            Vec::new(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_caches_resolve_once() {
        let registration = InterceptorRegistration::new(|| Ok(Noop));

        assert!(Arc::ptr_eq(&registration.factory(), &registration.factory()));
        assert!(Arc::ptr_eq(
            &registration.activator(),
            &registration.activator()
        ));
    }

    #[test]
    fn test_per_call_builds_new_instances() {
        let registration = InterceptorRegistration::new(|| Ok(Noop));
        let context = context();
        let activator = registration.activator();

        let a = activator.create(&context, &registration).unwrap();
        let b = activator.create(&context, &registration).unwrap();

        assert!(a.created());
        assert!(!Arc::ptr_eq(a.instance(), b.instance()));
    }

    #[test]
    fn test_shared_reuses_instance() {
        let registration = InterceptorRegistration::shared(Arc::new(Noop));
        let context = context();
        let activator = registration.activator();

        let a = activator.create(&context, &registration).unwrap();
        let b = activator.create(&context, &registration).unwrap();

        assert!(!a.created());
        assert!(Arc::ptr_eq(a.instance(), b.instance()));
    }

    #[test]
    fn test_construction_failure_names_type() {
        let registration =
            InterceptorRegistration::new(|| Err::<Noop, _>("missing config".to_string()));
        let context = context();

        let error = registration
            .activator()
            .create(&context, &registration)
            .unwrap_err();
        let message = error.to_string();

        assert!(matches!(error, Error::InterceptorConstructionFailed(_)));
        assert!(message.contains("Noop"));
        assert!(message.contains("missing config"));
    }

    #[test]
    fn test_downcast_wrong_type() {
        let message: AnyMessage = Box::new(5_u32);
        let status = downcast::<String>(message).unwrap_err();

        assert_eq!(status.code(), mqrpc_core::Code::Internal);
    }

    #[tokio::test]
    async fn test_response_writer_round_trip_through_erasure() {
        let (tx, rx) = flume::unbounded::<String>();
        let writer = ResponseWriter::from_channel(tx).erase().typed::<String>();

        writer.write("one".to_string()).await.unwrap();
        assert_eq!(rx.recv_async().await.unwrap(), "one");
    }
}
