//! Server call handlers: decode the request envelope, run the method invoker
//! and encode the outcome into a response envelope.

use crate::context::{CallState, ServerCallContext};
use crate::invoker::{
    ClientStreamingServerMethodInvoker, DuplexStreamingServerMethodInvoker,
    ServerStreamingServerMethodInvoker, UnaryServerMethodInvoker,
};
use crate::options::MethodOptions;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use mqrpc_core::compression::{self, find_provider};
use mqrpc_core::protocol::{ACCEPT_ENCODING_HEADER, ENCODING_HEADER, IDENTITY_ENCODING};
use mqrpc_core::{MethodDescriptor, RequestEnvelope, ResponseEnvelope, Status};
use tracing::{debug, error};

const HANDLER_FAULT_MESSAGE: &str = "Exception was thrown by handler.";

/// Handles calls for one registered method.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// The method this handler serves.
    fn method(&self) -> &MethodDescriptor;

    /// Options resolved for the method.
    fn options(&self) -> &Arc<MethodOptions>;

    /// Runs one call to completion. Never fails: faults are reported through
    /// the status of the returned envelope.
    async fn handle_call(
        &self,
        request: RequestEnvelope,
        context: Arc<ServerCallContext>,
    ) -> ResponseEnvelope;
}

/// Drives a call through its states around the kind specific `core`.
///
/// Faults and panics are caught here, once, and become the response status.
async fn run_call<F>(context: &ServerCallContext, core: F) -> ResponseEnvelope
where
    F: Future<Output = Result<ResponseEnvelope, Status>> + Send,
{
    context.transition(CallState::Invoking);

    let mut response = match AssertUnwindSafe(core).catch_unwind().await {
        Ok(Ok(response)) => {
            context.transition(CallState::Succeeded);
            response
        }
        Ok(Err(status)) => {
            debug!(
                "call {} failed with {}",
                context.method().full_name(),
                status
            );
            context.transition(CallState::Faulted);
            ResponseEnvelope::failure(status)
        }
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!(
                "error handling call {}: {}",
                context.method().full_name(),
                detail
            );
            let message = if context.options().enable_detailed_errors() {
                format!("{HANDLER_FAULT_MESSAGE} {detail}")
            } else {
                HANDLER_FAULT_MESSAGE.to_string()
            };
            context.transition(CallState::Faulted);
            ResponseEnvelope::failure(Status::unknown(message))
        }
    };

    context.set_status(response.status.clone());
    response.headers.extend(context.response_headers());
    context.transition(CallState::Completed);

    response
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn check_size(length: usize, limit: Option<usize>, direction: &str) -> Result<(), Status> {
    match limit {
        Some(limit) if length > limit => Err(Status::resource_exhausted(format!(
            "{direction} message exceeds the maximum configured message size."
        ))),
        _ => Ok(()),
    }
}

fn decode_request_body(
    encoding: Option<&str>,
    body: Bytes,
    options: &MethodOptions,
) -> Result<Bytes, Status> {
    let Some(encoding) = encoding.filter(|e| !e.eq_ignore_ascii_case(IDENTITY_ENCODING)) else {
        return Ok(body);
    };

    let providers = options.compression_providers();
    let provider = find_provider(providers, encoding).ok_or_else(|| {
        Status::unimplemented(format!(
            "Unsupported request encoding '{encoding}'. Supported encodings: {}",
            compression::accept_encoding(providers)
        ))
    })?;

    provider
        .decompress(&body)
        .map_err(|e| Status::internal(e.to_string()))
}

fn encode_response_body(
    body: Bytes,
    context: &ServerCallContext,
    options: &MethodOptions,
) -> Result<ResponseEnvelope, Status> {
    let Some(algorithm) = options.response_compression_algorithm() else {
        return Ok(ResponseEnvelope::success(body));
    };

    let accepted = context
        .request_header(ACCEPT_ENCODING_HEADER)
        .is_some_and(|header| compression::accepts(header, algorithm));
    let provider = find_provider(options.compression_providers(), algorithm);

    match provider {
        Some(provider) if accepted => {
            let compressed = provider
                .compress(&body, options.response_compression_level())
                .map_err(|e| Status::internal(e.to_string()))?;
            Ok(ResponseEnvelope::success(compressed)
                .with_header(ENCODING_HEADER, provider.encoding_name()))
        }
        _ => Ok(ResponseEnvelope::success(body)),
    }
}

/// Handles unary calls.
pub struct UnaryServerCallHandler<S, Req, Res> {
    invoker: UnaryServerMethodInvoker<S, Req, Res>,
}

impl<S, Req, Res> UnaryServerCallHandler<S, Req, Res>
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// Creates a handler around an invoker.
    pub const fn new(invoker: UnaryServerMethodInvoker<S, Req, Res>) -> Self {
        Self { invoker }
    }

    async fn handle_unary(
        &self,
        request: RequestEnvelope,
        context: Arc<ServerCallContext>,
    ) -> Result<ResponseEnvelope, Status> {
        let method = self.invoker.method();
        let options = self.invoker.options();

        let encoding = request.header(ENCODING_HEADER).map(str::to_owned);
        let body = decode_request_body(encoding.as_deref(), request.body, options)?;
        check_size(body.len(), options.max_receive_message_size(), "Received")?;

        let message = method
            .deserialize_request(body)
            .map_err(|e| Status::internal(format!("Failed to deserialize request message. {e}")))?;

        let response = self
            .invoker
            .invoke(message, Arc::clone(&context))
            .await?
            .ok_or_else(|| Status::cancelled("No message returned from method."))?;

        let body = method
            .serialize_response(&response)
            .map_err(|e| Status::internal(format!("Failed to serialize response message. {e}")))?;
        check_size(body.len(), options.max_send_message_size(), "Sending")?;

        encode_response_body(body, &context, options)
    }
}

#[async_trait]
impl<S, Req, Res> CallHandler for UnaryServerCallHandler<S, Req, Res>
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    Res: Send + 'static,
{
    fn method(&self) -> &MethodDescriptor {
        self.invoker.method().descriptor()
    }

    fn options(&self) -> &Arc<MethodOptions> {
        self.invoker.options()
    }

    async fn handle_call(
        &self,
        request: RequestEnvelope,
        context: Arc<ServerCallContext>,
    ) -> ResponseEnvelope {
        context.transition(CallState::HeadersInitialized);
        run_call(&context, self.handle_unary(request, Arc::clone(&context))).await
    }
}

macro_rules! unimplemented_call_handler {
    ($(#[$doc:meta])* $name:ident, $invoker:ident, $kind:literal) => {
        $(#[$doc])*
        pub struct $name<S, Req, Res> {
            invoker: $invoker<S, Req, Res>,
        }

        impl<S, Req, Res> $name<S, Req, Res>
        where
            S: Send + Sync + 'static,
            Req: Send + 'static,
            Res: Send + 'static,
        {
            /// Creates a handler around an invoker.
            pub const fn new(invoker: $invoker<S, Req, Res>) -> Self {
                Self { invoker }
            }
        }

        #[async_trait]
        impl<S, Req, Res> CallHandler for $name<S, Req, Res>
        where
            S: Send + Sync + 'static,
            Req: Send + 'static,
            Res: Send + 'static,
        {
            fn method(&self) -> &MethodDescriptor {
                self.invoker.method().descriptor()
            }

            fn options(&self) -> &Arc<MethodOptions> {
                self.invoker.options()
            }

            async fn handle_call(
                &self,
                _request: RequestEnvelope,
                context: Arc<ServerCallContext>,
            ) -> ResponseEnvelope {
                context.transition(CallState::HeadersInitialized);
                run_call(&context, async {
                    Err(Status::unimplemented(concat!(
                        $kind,
                        " calls are not supported over the broker transport."
                    )))
                })
                .await
            }
        }
    };
}

unimplemented_call_handler!(
    /// Handles client streaming calls. Dispatch is not supported by the
    /// transport, so every call completes with `Unimplemented`.
    ClientStreamingServerCallHandler,
    ClientStreamingServerMethodInvoker,
    "Client streaming"
);

unimplemented_call_handler!(
    /// Handles server streaming calls. Dispatch is not supported by the
    /// transport, so every call completes with `Unimplemented`.
    ServerStreamingServerCallHandler,
    ServerStreamingServerMethodInvoker,
    "Server streaming"
);

unimplemented_call_handler!(
    /// Handles duplex streaming calls. Dispatch is not supported by the
    /// transport, so every call completes with `Unimplemented`.
    DuplexStreamingServerCallHandler,
    DuplexStreamingServerMethodInvoker,
    "Duplex streaming"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activator::SingletonActivator;
    use crate::interceptor::RequestStream;
    use crate::invoker::{ClientStreamingServerMethod, UnaryServerMethod};
    use crate::options::ServiceOptions;

    use futures::future::BoxFuture;
    use mqrpc_core::marshaller::StringMarshaller;
    use mqrpc_core::{Code, CompressionProvider, GzipCompressionProvider, Method, MethodKind};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Default)]
    struct Echo;

    fn options(service: &ServiceOptions) -> Arc<MethodOptions> {
        Arc::new(MethodOptions::create([service]).unwrap())
    }

    fn unary_handler<F>(service: &ServiceOptions, f: F) -> UnaryServerCallHandler<Echo, String, String>
    where
        F: Fn(String) -> Result<Option<String>, Status> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let method: UnaryServerMethod<Echo, String, String> = Arc::new(
            move |_service: Arc<Echo>,
                  request: String,
                  _context: Arc<ServerCallContext>|
                  -> BoxFuture<'static, _> {
                let f = Arc::clone(&f);
                async move { f(request) }.boxed()
            },
        );
        UnaryServerCallHandler::new(UnaryServerMethodInvoker::new(
            method,
            Method::unary("Echo", "Say", StringMarshaller, StringMarshaller),
            options(service),
            Arc::new(SingletonActivator::new(Arc::new(Echo))),
        ))
    }

    fn context(handler: &dyn CallHandler, headers: Vec<(String, String)>) -> Arc<ServerCallContext> {
        Arc::new(ServerCallContext::new(
            handler.method().clone(),
            Arc::clone(handler.options()),
            headers,
            CancellationToken::new(),
        ))
    }

    fn request(body: &str) -> RequestEnvelope {
        RequestEnvelope::new("Echo", "Echo.Say", Bytes::copy_from_slice(body.as_bytes()))
    }

    #[tokio::test]
    async fn test_unary_success_completes_call() {
        let handler = unary_handler(&ServiceOptions::new(), |r| Ok(Some(format!("echo {r}"))));
        let context = context(&handler, Vec::new());
        context.add_response_header("x-served-by", "test");

        let response = handler.handle_call(request("hi"), Arc::clone(&context)).await;

        assert!(response.status.is_ok());
        assert_eq!(response.body.as_deref(), Some(&b"echo hi"[..]));
        assert_eq!(response.header("x-served-by"), Some("test"));
        assert_eq!(context.state(), CallState::Completed);
        assert!(context.status().is_ok());
    }

    #[tokio::test]
    async fn test_missing_response_is_cancelled() {
        // A method returning no message surfaces as Cancelled, not Internal.
        let handler = unary_handler(&ServiceOptions::new(), |_| Ok(None));
        let context = context(&handler, Vec::new());

        let response = handler.handle_call(request("hi"), Arc::clone(&context)).await;

        assert_eq!(response.status.code(), Code::Cancelled);
        assert_eq!(response.status.message(), "No message returned from method.");
        assert!(response.body.is_none());
        assert_eq!(context.status().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn test_status_fault_is_forwarded() {
        let handler = unary_handler(&ServiceOptions::new(), |_| {
            Err(Status::invalid_argument("bad name"))
        });
        let context = context(&handler, Vec::new());

        let response = handler.handle_call(request("hi"), context).await;

        assert_eq!(response.status, Status::invalid_argument("bad name"));
        assert!(response.body.is_none());
    }

    #[tokio::test]
    async fn test_panic_becomes_unknown() {
        let handler = unary_handler(&ServiceOptions::new(), |_| panic!("boom"));
        let context = context(&handler, Vec::new());

        let response = handler.handle_call(request("hi"), Arc::clone(&context)).await;

        assert_eq!(response.status.code(), Code::Unknown);
        assert_eq!(response.status.message(), "Exception was thrown by handler.");
        assert_eq!(context.state(), CallState::Completed);
    }

    #[tokio::test]
    async fn test_detailed_errors_include_panic_message() {
        let service = ServiceOptions::new().with_detailed_errors(true);
        let handler = unary_handler(&service, |_| panic!("boom"));
        let context = context(&handler, Vec::new());

        let response = handler.handle_call(request("hi"), context).await;

        assert_eq!(response.status.message(), "Exception was thrown by handler. boom");
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let service = ServiceOptions::new().with_max_receive_message_size(Some(4));
        let handler = unary_handler(&service, |r| Ok(Some(r)));
        let context = context(&handler, Vec::new());

        let response = handler.handle_call(request("too long"), context).await;

        assert_eq!(response.status.code(), Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_oversized_response_is_rejected() {
        let service = ServiceOptions::new().with_max_send_message_size(Some(4));
        let handler = unary_handler(&service, |r| Ok(Some(r.repeat(10))));
        let context = context(&handler, Vec::new());

        let response = handler.handle_call(request("abc"), context).await;

        assert_eq!(response.status.code(), Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_gzip_request_and_response() {
        let gzip = GzipCompressionProvider::default();
        let service = ServiceOptions::new().with_response_compression("gzip", None);
        let handler = unary_handler(&service, |r| Ok(Some(format!("echo {r}"))));
        let context = context(
            &handler,
            vec![(ACCEPT_ENCODING_HEADER.to_string(), "gzip".to_string())],
        );

        let body = gzip.compress(b"hi", None).unwrap();
        let request = RequestEnvelope::new("Echo", "Echo.Say", body).with_header(ENCODING_HEADER, "gzip");

        let response = handler.handle_call(request, context).await;

        assert!(response.status.is_ok());
        assert_eq!(response.header(ENCODING_HEADER), Some("gzip"));
        let body = gzip.decompress(response.body.as_deref().unwrap()).unwrap();
        assert_eq!(&body[..], b"echo hi");
    }

    #[tokio::test]
    async fn test_response_not_compressed_unless_accepted() {
        let service = ServiceOptions::new().with_response_compression("gzip", None);
        let handler = unary_handler(&service, |r| Ok(Some(r)));
        let context = context(&handler, Vec::new());

        let response = handler.handle_call(request("hi"), context).await;

        assert!(response.header(ENCODING_HEADER).is_none());
        assert_eq!(response.body.as_deref(), Some(&b"hi"[..]));
    }

    #[tokio::test]
    async fn test_unknown_request_encoding_is_unimplemented() {
        let handler = unary_handler(&ServiceOptions::new(), |r| Ok(Some(r)));
        let context = context(&handler, Vec::new());

        let response = handler
            .handle_call(request("hi").with_header(ENCODING_HEADER, "br"), context)
            .await;

        assert_eq!(response.status.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_streaming_handler_is_unimplemented() {
        let method: ClientStreamingServerMethod<Echo, String, String> = Arc::new(
            |_service: Arc<Echo>,
             _requests: RequestStream<String>,
             _context: Arc<ServerCallContext>|
             -> BoxFuture<'static, _> { async { Ok(None) }.boxed() },
        );
        let handler = ClientStreamingServerCallHandler::new(ClientStreamingServerMethodInvoker::new(
            method,
            Method::new(
                MethodKind::ClientStreaming,
                "Echo",
                "Collect",
                StringMarshaller,
                StringMarshaller,
            ),
            options(&ServiceOptions::new()),
            Arc::new(SingletonActivator::new(Arc::new(Echo))),
        ));
        let context = context(&handler, Vec::new());

        let response = handler.handle_call(request("hi"), Arc::clone(&context)).await;

        assert_eq!(response.status.code(), Code::Unimplemented);
        assert_eq!(context.state(), CallState::Completed);
    }
}
