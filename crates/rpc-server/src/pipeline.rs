use crate::context::ServerCallContext;
use crate::interceptor::{
    AnyMessage, ClientStreamingContinuation, DuplexStreamingContinuation, Interceptor,
    InterceptorRegistration, RequestStream, ResponseWriter, ServerStreamingContinuation,
    UnaryContinuation,
};

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use mqrpc_core::Status;
use tracing::error;

/// Composes interceptors around a terminal invoker.
///
/// The first registration is invoked first and wraps all the others: the list
/// is folded in reverse so the last registration sits next to the terminal.
#[derive(Debug)]
pub struct InterceptorPipelineBuilder {
    interceptors: Vec<Arc<InterceptorRegistration>>,
}

impl InterceptorPipelineBuilder {
    /// Creates a builder over registrations, outermost first.
    #[must_use]
    pub fn new(interceptors: &[Arc<InterceptorRegistration>]) -> Self {
        Self {
            interceptors: interceptors.to_vec(),
        }
    }

    /// Wraps a unary terminal invoker.
    #[must_use]
    pub fn unary_pipeline(&self, inner: UnaryContinuation) -> UnaryContinuation {
        self.build(inner, |registration, next| {
            Arc::new(
                move |request: AnyMessage,
                      context: Arc<ServerCallContext>|
                      -> BoxFuture<'static, _> {
                    let registration = Arc::clone(&registration);
                    let next = Arc::clone(&next);
                    Box::pin(async move {
                        with_interceptor(&registration, context, |interceptor, context| async move {
                            interceptor.unary_server_handler(request, context, next).await
                        })
                        .await
                    })
                },
            )
        })
    }

    /// Wraps a client streaming terminal invoker.
    #[must_use]
    pub fn client_streaming_pipeline(
        &self,
        inner: ClientStreamingContinuation,
    ) -> ClientStreamingContinuation {
        self.build(inner, |registration, next| {
            Arc::new(
                move |requests: RequestStream<AnyMessage>,
                      context: Arc<ServerCallContext>|
                      -> BoxFuture<'static, _> {
                    let registration = Arc::clone(&registration);
                    let next = Arc::clone(&next);
                    Box::pin(async move {
                        with_interceptor(&registration, context, |interceptor, context| async move {
                            interceptor
                                .client_streaming_server_handler(requests, context, next)
                                .await
                        })
                        .await
                    })
                },
            )
        })
    }

    /// Wraps a server streaming terminal invoker.
    #[must_use]
    pub fn server_streaming_pipeline(
        &self,
        inner: ServerStreamingContinuation,
    ) -> ServerStreamingContinuation {
        self.build(inner, |registration, next| {
            Arc::new(
                move |request: AnyMessage,
                      responses: ResponseWriter<AnyMessage>,
                      context: Arc<ServerCallContext>|
                      -> BoxFuture<'static, _> {
                    let registration = Arc::clone(&registration);
                    let next = Arc::clone(&next);
                    Box::pin(async move {
                        with_interceptor(&registration, context, |interceptor, context| async move {
                            interceptor
                                .server_streaming_server_handler(request, responses, context, next)
                                .await
                        })
                        .await
                    })
                },
            )
        })
    }

    /// Wraps a duplex streaming terminal invoker.
    #[must_use]
    pub fn duplex_streaming_pipeline(
        &self,
        inner: DuplexStreamingContinuation,
    ) -> DuplexStreamingContinuation {
        self.build(inner, |registration, next| {
            Arc::new(
                move |requests: RequestStream<AnyMessage>,
                      responses: ResponseWriter<AnyMessage>,
                      context: Arc<ServerCallContext>|
                      -> BoxFuture<'static, _> {
                    let registration = Arc::clone(&registration);
                    let next = Arc::clone(&next);
                    Box::pin(async move {
                        with_interceptor(&registration, context, |interceptor, context| async move {
                            interceptor
                                .duplex_streaming_server_handler(requests, responses, context, next)
                                .await
                        })
                        .await
                    })
                },
            )
        })
    }

    fn build<T>(&self, inner: T, wrap: impl Fn(Arc<InterceptorRegistration>, T) -> T) -> T {
        self.interceptors
            .iter()
            .rev()
            .fold(inner, |next, registration| wrap(Arc::clone(registration), next))
    }
}

/// Runs one interceptor layer: create the instance, call it, and always
/// release it. A panic further in is resumed after the release.
async fn with_interceptor<T, F, Fut>(
    registration: &InterceptorRegistration,
    context: Arc<ServerCallContext>,
    call: F,
) -> Result<T, Status>
where
    F: FnOnce(Arc<dyn Interceptor>, Arc<ServerCallContext>) -> Fut,
    Fut: Future<Output = Result<T, Status>> + Send,
{
    let activator = registration.activator();
    let handle = match activator.create(&context, registration) {
        Ok(handle) => handle,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    let interceptor = Arc::clone(handle.instance());
    let outcome = AssertUnwindSafe(call(interceptor, context))
        .catch_unwind()
        .await;

    activator.release(handle).await;

    match outcome {
        Ok(result) => result,
        Err(panic) => panic::resume_unwind(panic),
    }
}
