//! Terminal invokers: activate the service, call the application method and
//! release the service exactly once, whatever the outcome.

use crate::activator::ServiceActivator;
use crate::context::ServerCallContext;
use crate::interceptor::{
    AnyMessage, ClientStreamingContinuation, DuplexStreamingContinuation, RequestStream,
    ResponseWriter, ServerStreamingContinuation, UnaryContinuation, downcast,
};
use crate::options::MethodOptions;
use crate::pipeline::InterceptorPipelineBuilder;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use mqrpc_core::{Method, Status};
use tracing::error;

/// Application method for unary calls.
pub type UnaryServerMethod<S, Req, Res> = Arc<
    dyn Fn(Arc<S>, Req, Arc<ServerCallContext>) -> BoxFuture<'static, Result<Option<Res>, Status>>
        + Send
        + Sync,
>;

/// Application method for client streaming calls.
pub type ClientStreamingServerMethod<S, Req, Res> = Arc<
    dyn Fn(
            Arc<S>,
            RequestStream<Req>,
            Arc<ServerCallContext>,
        ) -> BoxFuture<'static, Result<Option<Res>, Status>>
        + Send
        + Sync,
>;

/// Application method for server streaming calls.
pub type ServerStreamingServerMethod<S, Req, Res> = Arc<
    dyn Fn(
            Arc<S>,
            Req,
            ResponseWriter<Res>,
            Arc<ServerCallContext>,
        ) -> BoxFuture<'static, Result<(), Status>>
        + Send
        + Sync,
>;

/// Application method for duplex streaming calls.
pub type DuplexStreamingServerMethod<S, Req, Res> = Arc<
    dyn Fn(
            Arc<S>,
            RequestStream<Req>,
            ResponseWriter<Res>,
            Arc<ServerCallContext>,
        ) -> BoxFuture<'static, Result<(), Status>>
        + Send
        + Sync,
>;

/// Activates a service instance, runs `call` on it and releases it.
///
/// `call` may panic before returning its future or while the future runs;
/// either way the instance is released first and the panic then resumes so
/// the call handler can turn it into a status.
async fn with_service<S, T, F>(
    activator: &dyn ServiceActivator<S>,
    context: Arc<ServerCallContext>,
    call: F,
) -> Result<T, Status>
where
    S: Send + Sync + 'static,
    F: FnOnce(Arc<S>, Arc<ServerCallContext>) -> BoxFuture<'static, Result<T, Status>>,
{
    let handle = activator.create(&context).map_err(|e| {
        error!("{}", e);
        Status::internal(e.to_string())
    })?;

    let instance = handle.instance();
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| call(instance, context))) {
        Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
        Err(panic) => Err(panic),
    };

    activator.release(handle).await;

    match outcome {
        Ok(result) => result,
        Err(panic) => panic::resume_unwind(panic),
    }
}

struct InvokerParts<S, Req, Res> {
    activator: Arc<dyn ServiceActivator<S>>,
    method: Method<Req, Res>,
    options: Arc<MethodOptions>,
}

impl<S, Req, Res> InvokerParts<S, Req, Res>
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    Res: Send + 'static,
{
    fn pipeline(&self) -> Option<InterceptorPipelineBuilder> {
        self.options
            .has_interceptors()
            .then(|| InterceptorPipelineBuilder::new(self.options.interceptors()))
    }
}

macro_rules! invoker_accessors {
    () => {
        /// The method being invoked.
        #[must_use]
        pub const fn method(&self) -> &Method<Req, Res> {
            &self.parts.method
        }

        /// Options resolved for the method.
        #[must_use]
        pub fn options(&self) -> &Arc<MethodOptions> {
            &self.parts.options
        }
    };
}

/// Invokes unary methods.
pub struct UnaryServerMethodInvoker<S, Req, Res> {
    invoker: UnaryServerMethod<S, Req, Res>,
    parts: InvokerParts<S, Req, Res>,
    pipeline: Option<UnaryContinuation>,
}

impl<S, Req, Res> UnaryServerMethodInvoker<S, Req, Res>
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// Creates an invoker, wrapping it in the interceptor pipeline if the
    /// options have interceptors.
    pub fn new(
        invoker: UnaryServerMethod<S, Req, Res>,
        method: Method<Req, Res>,
        options: Arc<MethodOptions>,
        activator: Arc<dyn ServiceActivator<S>>,
    ) -> Self {
        let parts = InvokerParts {
            activator,
            method,
            options,
        };

        let pipeline = parts.pipeline().map(|builder| {
            let activator = Arc::clone(&parts.activator);
            let invoker = Arc::clone(&invoker);
            let terminal: UnaryContinuation = Arc::new(
                move |request: AnyMessage,
                      context: Arc<ServerCallContext>|
                      -> BoxFuture<'static, _> {
                    let activator = Arc::clone(&activator);
                    let invoker = Arc::clone(&invoker);
                    Box::pin(async move {
                        let request = downcast::<Req>(request)?;
                        let response = with_service(activator.as_ref(), context, |service, context| {
                            invoker(service, request, context)
                        })
                        .await?;
                        Ok(response.map(|r| Box::new(r) as AnyMessage))
                    })
                },
            );
            builder.unary_pipeline(terminal)
        });

        Self {
            invoker,
            parts,
            pipeline,
        }
    }

    invoker_accessors!();

    /// Invokes the method.
    ///
    /// # Errors
    ///
    /// Returns the status the method, an interceptor or activation failed with.
    pub async fn invoke(
        &self,
        request: Req,
        context: Arc<ServerCallContext>,
    ) -> Result<Option<Res>, Status> {
        match &self.pipeline {
            None => {
                with_service(self.parts.activator.as_ref(), context, |service, context| {
                    (self.invoker)(service, request, context)
                })
                .await
            }
            Some(pipeline) => pipeline(Box::new(request), context)
                .await?
                .map(downcast::<Res>)
                .transpose(),
        }
    }
}

/// Invokes client streaming methods.
pub struct ClientStreamingServerMethodInvoker<S, Req, Res> {
    invoker: ClientStreamingServerMethod<S, Req, Res>,
    parts: InvokerParts<S, Req, Res>,
    pipeline: Option<ClientStreamingContinuation>,
}

impl<S, Req, Res> ClientStreamingServerMethodInvoker<S, Req, Res>
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// Creates an invoker.
    pub fn new(
        invoker: ClientStreamingServerMethod<S, Req, Res>,
        method: Method<Req, Res>,
        options: Arc<MethodOptions>,
        activator: Arc<dyn ServiceActivator<S>>,
    ) -> Self {
        let parts = InvokerParts {
            activator,
            method,
            options,
        };

        let pipeline = parts.pipeline().map(|builder| {
            let activator = Arc::clone(&parts.activator);
            let invoker = Arc::clone(&invoker);
            let terminal: ClientStreamingContinuation = Arc::new(
                move |requests: RequestStream<AnyMessage>,
                      context: Arc<ServerCallContext>|
                      -> BoxFuture<'static, _> {
                    let activator = Arc::clone(&activator);
                    let invoker = Arc::clone(&invoker);
                    Box::pin(async move {
                        let requests = requests
                            .map(|request| request.and_then(downcast::<Req>))
                            .boxed();
                        let response =
                            with_service(activator.as_ref(), context, |service, context| {
                                invoker(service, requests, context)
                            })
                            .await?;
                        Ok(response.map(|r| Box::new(r) as AnyMessage))
                    })
                },
            );
            builder.client_streaming_pipeline(terminal)
        });

        Self {
            invoker,
            parts,
            pipeline,
        }
    }

    invoker_accessors!();

    /// Invokes the method.
    ///
    /// # Errors
    ///
    /// Returns the status the method, an interceptor or activation failed with.
    pub async fn invoke(
        &self,
        requests: RequestStream<Req>,
        context: Arc<ServerCallContext>,
    ) -> Result<Option<Res>, Status> {
        match &self.pipeline {
            None => {
                with_service(self.parts.activator.as_ref(), context, |service, context| {
                    (self.invoker)(service, requests, context)
                })
                .await
            }
            Some(pipeline) => {
                let requests = requests
                    .map(|request| request.map(|r| Box::new(r) as AnyMessage))
                    .boxed();
                pipeline(requests, context)
                    .await?
                    .map(downcast::<Res>)
                    .transpose()
            }
        }
    }
}

/// Invokes server streaming methods.
pub struct ServerStreamingServerMethodInvoker<S, Req, Res> {
    invoker: ServerStreamingServerMethod<S, Req, Res>,
    parts: InvokerParts<S, Req, Res>,
    pipeline: Option<ServerStreamingContinuation>,
}

impl<S, Req, Res> ServerStreamingServerMethodInvoker<S, Req, Res>
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// Creates an invoker.
    pub fn new(
        invoker: ServerStreamingServerMethod<S, Req, Res>,
        method: Method<Req, Res>,
        options: Arc<MethodOptions>,
        activator: Arc<dyn ServiceActivator<S>>,
    ) -> Self {
        let parts = InvokerParts {
            activator,
            method,
            options,
        };

        let pipeline = parts.pipeline().map(|builder| {
            let activator = Arc::clone(&parts.activator);
            let invoker = Arc::clone(&invoker);
            let terminal: ServerStreamingContinuation = Arc::new(
                move |request: AnyMessage,
                      responses: ResponseWriter<AnyMessage>,
                      context: Arc<ServerCallContext>|
                      -> BoxFuture<'static, _> {
                    let activator = Arc::clone(&activator);
                    let invoker = Arc::clone(&invoker);
                    Box::pin(async move {
                        let request = downcast::<Req>(request)?;
                        let responses = responses.typed::<Res>();
                        with_service(activator.as_ref(), context, |service, context| {
                            invoker(service, request, responses, context)
                        })
                        .await
                    })
                },
            );
            builder.server_streaming_pipeline(terminal)
        });

        Self {
            invoker,
            parts,
            pipeline,
        }
    }

    invoker_accessors!();

    /// Invokes the method.
    ///
    /// # Errors
    ///
    /// Returns the status the method, an interceptor or activation failed with.
    pub async fn invoke(
        &self,
        request: Req,
        responses: ResponseWriter<Res>,
        context: Arc<ServerCallContext>,
    ) -> Result<(), Status> {
        match &self.pipeline {
            None => {
                with_service(self.parts.activator.as_ref(), context, |service, context| {
                    (self.invoker)(service, request, responses, context)
                })
                .await
            }
            Some(pipeline) => pipeline(Box::new(request), responses.erase(), context).await,
        }
    }
}

/// Invokes duplex streaming methods.
pub struct DuplexStreamingServerMethodInvoker<S, Req, Res> {
    invoker: DuplexStreamingServerMethod<S, Req, Res>,
    parts: InvokerParts<S, Req, Res>,
    pipeline: Option<DuplexStreamingContinuation>,
}

impl<S, Req, Res> DuplexStreamingServerMethodInvoker<S, Req, Res>
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// Creates an invoker.
    pub fn new(
        invoker: DuplexStreamingServerMethod<S, Req, Res>,
        method: Method<Req, Res>,
        options: Arc<MethodOptions>,
        activator: Arc<dyn ServiceActivator<S>>,
    ) -> Self {
        let parts = InvokerParts {
            activator,
            method,
            options,
        };

        let pipeline = parts.pipeline().map(|builder| {
            let activator = Arc::clone(&parts.activator);
            let invoker = Arc::clone(&invoker);
            let terminal: DuplexStreamingContinuation = Arc::new(
                move |requests: RequestStream<AnyMessage>,
                      responses: ResponseWriter<AnyMessage>,
                      context: Arc<ServerCallContext>|
                      -> BoxFuture<'static, _> {
                    let activator = Arc::clone(&activator);
                    let invoker = Arc::clone(&invoker);
                    Box::pin(async move {
                        let requests = requests
                            .map(|request| request.and_then(downcast::<Req>))
                            .boxed();
                        let responses = responses.typed::<Res>();
                        with_service(activator.as_ref(), context, |service, context| {
                            invoker(service, requests, responses, context)
                        })
                        .await
                    })
                },
            );
            builder.duplex_streaming_pipeline(terminal)
        });

        Self {
            invoker,
            parts,
            pipeline,
        }
    }

    invoker_accessors!();

    /// Invokes the method.
    ///
    /// # Errors
    ///
    /// Returns the status the method, an interceptor or activation failed with.
    pub async fn invoke(
        &self,
        requests: RequestStream<Req>,
        responses: ResponseWriter<Res>,
        context: Arc<ServerCallContext>,
    ) -> Result<(), Status> {
        match &self.pipeline {
            None => {
                with_service(self.parts.activator.as_ref(), context, |service, context| {
                    (self.invoker)(service, requests, responses, context)
                })
                .await
            }
            Some(pipeline) => {
                let requests = requests
                    .map(|request| request.map(|r| Box::new(r) as AnyMessage))
                    .boxed();
                pipeline(requests, responses.erase(), context).await
            }
        }
    }
}
