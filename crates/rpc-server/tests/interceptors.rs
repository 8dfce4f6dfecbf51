//! Interceptor ordering and service activation through the call handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use mqrpc_core::marshaller::StringMarshaller;
use mqrpc_core::{Code, Method, RequestEnvelope, ResponseEnvelope, Status};
use mqrpc_server::interceptor::UnaryContinuation;
use mqrpc_server::{
    ActivatorHandle, AnyMessage, CallHandler, CallState, Interceptor, InterceptorRegistration,
    MethodRegistry, Result, ServerCallContext, ServiceActivator, ServiceOptions,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

type Log = Arc<Mutex<Vec<String>>>;

struct Recording {
    log: Log,
    name: &'static str,
}

#[async_trait]
impl Interceptor for Recording {
    async fn unary_server_handler(
        &self,
        request: AnyMessage,
        context: Arc<ServerCallContext>,
        next: UnaryContinuation,
    ) -> std::result::Result<Option<AnyMessage>, Status> {
        self.log.lock().push(format!("{}-before", self.name));
        let response = next(request, context).await;
        self.log.lock().push(format!("{}-after", self.name));
        response
    }
}

struct Shouting;

#[async_trait]
impl Interceptor for Shouting {
    async fn unary_server_handler(
        &self,
        request: AnyMessage,
        context: Arc<ServerCallContext>,
        next: UnaryContinuation,
    ) -> std::result::Result<Option<AnyMessage>, Status> {
        let request = mqrpc_server::downcast::<String>(request)?;
        next(Box::new(request.to_uppercase()), context).await
    }
}

struct Gatekeeper;

#[async_trait]
impl Interceptor for Gatekeeper {
    async fn unary_server_handler(
        &self,
        _request: AnyMessage,
        _context: Arc<ServerCallContext>,
        _next: UnaryContinuation,
    ) -> std::result::Result<Option<AnyMessage>, Status> {
        Err(Status::permission_denied("Keep out."))
    }
}

struct Service {
    log: Log,
}

#[derive(Default)]
struct CountingActivator {
    created: AtomicUsize,
    log: Log,
    released: AtomicUsize,
}

#[async_trait]
impl ServiceActivator<Service> for CountingActivator {
    fn create(&self, _context: &ServerCallContext) -> Result<ActivatorHandle<Service>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ActivatorHandle::new(
            Arc::new(Service {
                log: Arc::clone(&self.log),
            }),
            true,
        ))
    }

    async fn release(&self, _handle: ActivatorHandle<Service>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn say() -> Method<String, String> {
    Method::unary("Echo", "Say", StringMarshaller, StringMarshaller)
}

fn registry(options: ServiceOptions, activator: Arc<CountingActivator>) -> MethodRegistry {
    let registry = MethodRegistry::with_options(options);
    registry
        .bind_service::<Service>(activator, &ServiceOptions::default())
        .unwrap()
        .add_unary(say(), |service: Arc<Service>, request: String, _| {
            if request == "sync panic" {
                panic!("panicked before returning a future");
            }
            async move {
                service.log.lock().push("handler".to_string());
                match request.as_str() {
                    "async panic" => panic!("panicked while running"),
                    "fail" => Err(Status::invalid_argument("Bad request.")),
                    _ => Ok(Some(format!("echo {request}"))),
                }
            }
        })
        .unwrap();
    registry
}

async fn call(registry: &MethodRegistry, body: &str) -> (ResponseEnvelope, Arc<ServerCallContext>) {
    let handler = registry.lookup("Echo", "Echo.Say").unwrap();
    let context = Arc::new(ServerCallContext::new(
        handler.method().clone(),
        Arc::clone(handler.options()),
        Vec::new(),
        CancellationToken::new(),
    ));
    let request = RequestEnvelope::new("Echo", "Echo.Say", body.to_string());
    let response = handler.handle_call(request, Arc::clone(&context)).await;
    (response, context)
}

fn recording(log: &Log, name: &'static str) -> InterceptorRegistration {
    let log = Arc::clone(log);
    InterceptorRegistration::new(move || {
        Ok(Recording {
            log: Arc::clone(&log),
            name,
        })
    })
}

#[tokio::test]
async fn test_interceptors_run_in_registration_order() {
    let activator = Arc::new(CountingActivator::default());
    let log = Arc::clone(&activator.log);
    let options = ServiceOptions::new()
        .with_interceptor(recording(&log, "A"))
        .with_interceptor(recording(&log, "B"));
    let registry = registry(options, Arc::clone(&activator));

    let (response, _) = call(&registry, "hi").await;

    assert!(response.status.is_ok());
    assert_eq!(
        *log.lock(),
        vec!["A-before", "B-before", "handler", "B-after", "A-after"]
    );
}

#[tokio::test]
async fn test_global_interceptors_wrap_service_interceptors() {
    let activator = Arc::new(CountingActivator::default());
    let log = Arc::clone(&activator.log);
    let mut registry = MethodRegistry::new();
    registry.register_interceptor(recording(&log, "global"));
    registry
        .bind_service(
            Arc::clone(&activator) as Arc<dyn ServiceActivator<Service>>,
            &ServiceOptions::new().with_interceptor(recording(&log, "service")),
        )
        .unwrap()
        .add_unary(say(), |service: Arc<Service>, request: String, _| async move {
            service.log.lock().push("handler".to_string());
            Ok(Some(request))
        })
        .unwrap();

    let (response, _) = call(&registry, "hi").await;

    assert!(response.status.is_ok());
    assert_eq!(
        *log.lock(),
        vec![
            "global-before",
            "service-before",
            "handler",
            "service-after",
            "global-after"
        ]
    );
}

#[tokio::test]
async fn test_interceptor_can_replace_request() {
    let activator = Arc::new(CountingActivator::default());
    let options = ServiceOptions::new().with_interceptor(InterceptorRegistration::new(|| Ok(Shouting)));
    let registry = registry(options, activator);

    let (response, _) = call(&registry, "hi").await;

    assert_eq!(response.body.as_deref(), Some(&b"echo HI"[..]));
}

#[tokio::test]
async fn test_short_circuit_skips_activation() {
    let activator = Arc::new(CountingActivator::default());
    let options = ServiceOptions::new()
        .with_interceptor(InterceptorRegistration::shared(Arc::new(Gatekeeper)));
    let registry = registry(options, Arc::clone(&activator));

    let (response, _) = call(&registry, "hi").await;

    assert_eq!(response.status.code(), Code::PermissionDenied);
    assert_eq!(activator.created.load(Ordering::SeqCst), 0);
    assert_eq!(activator.released.load(Ordering::SeqCst), 0);
}

#[tokio::test]
#[traced_test]
async fn test_interceptor_construction_failure_is_internal() {
    let activator = Arc::new(CountingActivator::default());
    let options = ServiceOptions::new().with_interceptor(InterceptorRegistration::new(
        || -> std::result::Result<Shouting, String> { Err("no configuration".to_string()) },
    ));
    let registry = registry(options, Arc::clone(&activator));

    let (response, context) = call(&registry, "hi").await;

    assert_eq!(response.status.code(), Code::Internal);
    assert!(response.status.message().contains("Shouting"));
    assert!(response.status.message().contains("no configuration"));
    assert_eq!(context.state(), CallState::Completed);
    assert_eq!(activator.created.load(Ordering::SeqCst), 0);
    assert!(logs_contain("could not construct interceptor instance"));
}

#[tokio::test]
async fn test_service_released_exactly_once() {
    for (body, code) in [
        ("hi", Code::Ok),
        ("fail", Code::InvalidArgument),
        ("sync panic", Code::Unknown),
        ("async panic", Code::Unknown),
    ] {
        for interceptors in [false, true] {
            let activator = Arc::new(CountingActivator::default());
            let log = Arc::clone(&activator.log);
            let options = if interceptors {
                ServiceOptions::new().with_interceptor(recording(&log, "A"))
            } else {
                ServiceOptions::new()
            };
            let registry = registry(options, Arc::clone(&activator));

            let (response, context) = call(&registry, body).await;

            assert_eq!(response.status.code(), code, "{body}, interceptors: {interceptors}");
            assert_eq!(activator.created.load(Ordering::SeqCst), 1);
            assert_eq!(activator.released.load(Ordering::SeqCst), 1);
            assert_eq!(context.state(), CallState::Completed);
            if interceptors && code != Code::Unknown {
                assert_eq!(log.lock().last().map(String::as_str), Some("A-after"));
            }
        }
    }
}
