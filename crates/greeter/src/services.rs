use crate::interceptor::TimingInterceptor;
use crate::messages::{FibReply, FibRequest, HelloReply, HelloRequest};

use std::sync::Arc;

use mqrpc_core::marshaller::CborMarshaller;
use mqrpc_core::{Method, Status};
use mqrpc_server::{
    InterceptorRegistration, MethodRegistry, PerCallActivator, Result, ServerCallContext,
    ServiceOptions, SingletonActivator,
};
use tracing::debug;

/// Largest index Fibonacci will compute.
pub const MAX_FIB: u32 = 46;

/// `Greet.SayHello`.
#[must_use]
pub fn say_hello() -> Method<HelloRequest, HelloReply> {
    Method::unary(
        "Greet",
        "SayHello",
        CborMarshaller::new(),
        CborMarshaller::new(),
    )
}

/// `Fibonacci.Fib`.
#[must_use]
pub fn fib() -> Method<FibRequest, FibReply> {
    Method::unary(
        "Fibonacci",
        "Fib",
        CborMarshaller::new(),
        CborMarshaller::new(),
    )
}

/// Greets callers by name.
#[derive(Debug, Default)]
pub struct Greeter;

impl Greeter {
    /// Greets `request.name`. Refuses `nobody` in any letter case.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` for `nobody`.
    pub fn say_hello(&self, request: &HelloRequest) -> std::result::Result<HelloReply, Status> {
        if request.name.eq_ignore_ascii_case("nobody") {
            return Err(Status::permission_denied(format!(
                "Unable to say hello to '{}'",
                request.name
            )));
        }

        Ok(HelloReply {
            message: format!("Hello {}", request.name),
        })
    }
}

/// Computes Fibonacci numbers, one instance per call.
#[derive(Debug, Default)]
pub struct Fibonacci;

impl Fibonacci {
    /// Computes `Fib(request.max)`, yielding between steps and giving up once
    /// the call is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when `max` is above [`MAX_FIB`] and
    /// `Cancelled` when the call is cancelled midway.
    pub async fn fib(
        &self,
        request: FibRequest,
        context: &ServerCallContext,
    ) -> std::result::Result<FibReply, Status> {
        if request.max > MAX_FIB {
            return Err(Status::invalid_argument("Max out of range"));
        }

        let (mut current, mut next) = (0_u64, 1_u64);
        for step in 0..request.max {
            if context.is_cancelled() {
                debug!("fib({}) cancelled at step {}", request.max, step);
                return Err(Status::cancelled("Fibonacci was cancelled."));
            }

            (current, next) = (next, current + next);
            tokio::task::yield_now().await;
        }

        Ok(FibReply { number: current })
    }
}

/// Builds the registry with both services bound behind the timing
/// interceptor.
///
/// # Errors
///
/// Returns an error if a method is registered twice.
pub fn registry() -> Result<MethodRegistry> {
    let mut registry = MethodRegistry::new();
    registry.register_interceptor(InterceptorRegistration::new(|| Ok(TimingInterceptor)));

    registry
        .bind_service::<Greeter>(
            Arc::new(SingletonActivator::new(Arc::new(Greeter))),
            &ServiceOptions::default(),
        )?
        .add_unary(say_hello(), |greeter: Arc<Greeter>, request, _| async move {
            greeter.say_hello(&request).map(Some)
        })?;

    registry
        .bind_service::<Fibonacci>(
            Arc::new(PerCallActivator::<Fibonacci>::default()),
            &ServiceOptions::default(),
        )?
        .add_unary(fib(), |fibonacci: Arc<Fibonacci>, request, context| async move {
            fibonacci.fib(request, &context).await.map(Some)
        })?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    use mqrpc_core::{Code, MethodKind};
    use mqrpc_server::MethodOptions;
    use tokio_util::sync::CancellationToken;

    fn context(token: CancellationToken) -> ServerCallContext {
        ServerCallContext::new(
            fib().descriptor().clone(),
            Arc::new(MethodOptions::default()),
            Vec::new(),
            token,
        )
    }

    #[test]
    fn test_greeter_refuses_nobody() {
        let greeter = Greeter;

        let reply = greeter
            .say_hello(&HelloRequest {
                name: "GreeterClient".to_string(),
            })
            .unwrap();
        assert_eq!(reply.message, "Hello GreeterClient");

        for name in ["nobody", "NoBody"] {
            let status = greeter
                .say_hello(&HelloRequest {
                    name: name.to_string(),
                })
                .unwrap_err();
            assert_eq!(status.code(), Code::PermissionDenied);
            assert_eq!(
                status.message(),
                format!("Unable to say hello to '{name}'")
            );
        }
    }

    #[tokio::test]
    async fn test_fib_numbers() {
        let token = CancellationToken::new();

        for (max, number) in [(0, 0), (1, 1), (2, 1), (10, 55)] {
            let reply = Fibonacci
                .fib(FibRequest { max }, &context(token.clone()))
                .await
                .unwrap();
            assert_eq!(reply.number, number, "fib({max})");
        }
    }

    #[tokio::test]
    async fn test_fib_bounds() {
        let token = CancellationToken::new();

        let largest = Fibonacci
            .fib(FibRequest { max: MAX_FIB }, &context(token.clone()))
            .await
            .unwrap();
        assert_eq!(largest.number, 1_836_311_903);

        let status = Fibonacci
            .fib(FibRequest { max: MAX_FIB + 1 }, &context(token))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "Max out of range");
    }

    #[tokio::test]
    async fn test_fib_observes_cancellation() {
        let token = CancellationToken::new();
        token.cancel();

        let status = Fibonacci
            .fib(FibRequest { max: 10 }, &context(token))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Cancelled);
    }

    #[test]
    fn test_registry_binds_both_services() {
        let registry = registry().unwrap();

        assert_eq!(registry.len(), 2);
        let handler = registry.lookup("Fibonacci", "Fibonacci.Fib").unwrap();
        assert_eq!(handler.method().kind(), MethodKind::Unary);
        assert!(handler.options().has_interceptors());
    }
}
