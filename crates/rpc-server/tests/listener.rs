//! Listener tests over the in-memory broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mqrpc_broker::{
    Broker, ConsumeOptions, DeliveryStream, Message, MessageProperties, QueueOptions,
};
use mqrpc_broker_memory::{Error as MemoryError, MemoryBroker};
use mqrpc_core::marshaller::StringMarshaller;
use mqrpc_core::protocol::{DEFAULT_REQUEST_QUEUE, REQUEST_CONTENT_TYPE, RESPONSE_CONTENT_TYPE};
use mqrpc_core::{Code, Method, RequestEnvelope, ResponseEnvelope, Status};
use mqrpc_server::{
    Error, ListenerOptions, MethodRegistry, RpcListener, ServiceOptions, SingletonActivator,
};
use tokio::sync::{Barrier, Notify};
use tokio::time::timeout;
use tracing_test::traced_test;

struct Greeter {
    barrier: Barrier,
    started: Notify,
}

impl Default for Greeter {
    fn default() -> Self {
        Self {
            barrier: Barrier::new(2),
            started: Notify::new(),
        }
    }
}

fn registry(greeter: Arc<Greeter>) -> MethodRegistry {
    let registry = MethodRegistry::new();
    registry
        .bind_service::<Greeter>(
            Arc::new(SingletonActivator::new(greeter)),
            &ServiceOptions::default(),
        )
        .unwrap()
        .add_unary(
            Method::unary("Greet", "SayHello", StringMarshaller, StringMarshaller),
            |_, name: String, _| async move { Ok(Some(format!("Hello {name}"))) },
        )
        .unwrap()
        .add_unary(
            Method::unary("Greet", "Rendezvous", StringMarshaller, StringMarshaller),
            |greeter: Arc<Greeter>, name: String, _| async move {
                greeter.barrier.wait().await;
                Ok(Some(name))
            },
        )
        .unwrap()
        .add_unary(
            Method::unary("Greet", "WaitForCancel", StringMarshaller, StringMarshaller),
            |greeter: Arc<Greeter>, _name: String, context| async move {
                greeter.started.notify_one();
                tokio::select! {
                    () = context.cancellation_token().cancelled() => {
                        Ok(Some(format!("cancelled, deadline set: {}", context.deadline().is_some())))
                    }
                    () = tokio::time::sleep(Duration::from_secs(30)) => Err(Status::internal("not cancelled")),
                }
            },
        )
        .unwrap();
    registry
}

async fn start(
    greeter: Arc<Greeter>,
    workers: usize,
) -> (MemoryBroker, RpcListener<MemoryBroker>) {
    let broker = MemoryBroker::new();
    let listener = RpcListener::new(
        broker.clone(),
        Arc::new(registry(greeter)),
        ListenerOptions::default().with_workers(workers),
    );
    listener.start().await.unwrap();
    (broker, listener)
}

async fn reply_queue(broker: &MemoryBroker) -> (String, DeliveryStream) {
    let queue = broker
        .declare_queue(QueueOptions::server_named())
        .await
        .unwrap();
    let replies = broker
        .consume(&queue, ConsumeOptions::default())
        .await
        .unwrap();
    (queue, replies)
}

async fn send(
    broker: &MemoryBroker,
    reply_to: &str,
    correlation_id: &str,
    body: impl Into<bytes::Bytes>,
    expiration: Option<Duration>,
) {
    let mut properties = MessageProperties::default()
        .with_content_type(REQUEST_CONTENT_TYPE)
        .with_correlation_id(correlation_id)
        .with_reply_to(reply_to);
    if let Some(expiration) = expiration {
        properties = properties.with_expiration(expiration);
    }

    broker
        .publish(
            DEFAULT_REQUEST_QUEUE,
            Message::new(body).with_properties(properties),
        )
        .await
        .unwrap();
}

async fn receive(replies: &mut DeliveryStream) -> (ResponseEnvelope, MessageProperties) {
    let delivery = timeout(Duration::from_secs(5), replies.next())
        .await
        .expect("timed out waiting for reply")
        .expect("reply stream ended");
    let properties = delivery.message().properties.clone();
    let response = ResponseEnvelope::decode(&delivery.message().body).unwrap();
    delivery.ack().await.unwrap();
    (response, properties)
}

fn request(service: &str, method: &str, body: &str) -> bytes::Bytes {
    RequestEnvelope::new(service, method, body.to_string())
        .encode()
        .unwrap()
}

#[tokio::test]
async fn test_unary_call_round_trip() {
    let (broker, listener) = start(Arc::default(), 4).await;
    let (queue, mut replies) = reply_queue(&broker).await;

    send(
        &broker,
        &queue,
        "call-1",
        request("Greet", "Greet.SayHello", "GreeterClient"),
        None,
    )
    .await;
    let (response, properties) = receive(&mut replies).await;

    assert!(response.status.is_ok());
    assert_eq!(response.body.as_deref(), Some(&b"Hello GreeterClient"[..]));
    assert_eq!(properties.correlation_id.as_deref(), Some("call-1"));
    assert_eq!(properties.content_type.as_deref(), Some(RESPONSE_CONTENT_TYPE));
    assert!(properties.timestamp.is_some());

    listener.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_unknown_service_replies_not_found() {
    let (broker, listener) = start(Arc::default(), 1).await;
    let (queue, mut replies) = reply_queue(&broker).await;

    send(&broker, &queue, "call-1", request("Foo", "Foo.Bar", ""), None).await;
    let (response, _) = receive(&mut replies).await;

    assert_eq!(response.status.code(), Code::NotFound);
    assert!(response.body.is_none());
    assert!(logs_contain("service Foo is unimplemented"));

    listener.shutdown().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_unknown_method_replies_not_found() {
    let (broker, listener) = start(Arc::default(), 1).await;
    let (queue, mut replies) = reply_queue(&broker).await;

    send(
        &broker,
        &queue,
        "call-1",
        request("Greet", "Greet.SayGoodbye", ""),
        None,
    )
    .await;
    let (response, _) = receive(&mut replies).await;

    assert_eq!(response.status.code(), Code::NotFound);
    assert!(logs_contain("method Greet.SayGoodbye of service Greet is unimplemented"));

    listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_envelope_replies_internal() {
    let (broker, listener) = start(Arc::default(), 1).await;
    let (queue, mut replies) = reply_queue(&broker).await;

    send(&broker, &queue, "call-1", &b"not cbor"[..], None).await;
    let (response, properties) = receive(&mut replies).await;

    assert_eq!(response.status.code(), Code::Internal);
    assert_eq!(response.status.message(), "Failed to parse request envelope");
    assert_eq!(properties.correlation_id.as_deref(), Some("call-1"));
    assert_eq!(broker.message_count(DEFAULT_REQUEST_QUEUE), Some(0));

    listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expiration_cancels_call() {
    let (broker, listener) = start(Arc::default(), 1).await;
    let (queue, mut replies) = reply_queue(&broker).await;

    send(
        &broker,
        &queue,
        "call-1",
        request("Greet", "Greet.WaitForCancel", ""),
        Some(Duration::from_millis(100)),
    )
    .await;
    let (response, _) = receive(&mut replies).await;

    assert!(response.status.is_ok());
    assert_eq!(
        response.body.as_deref(),
        Some(&b"cancelled, deadline set: true"[..])
    );

    listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_workers_handle_calls_in_parallel() {
    // Both calls must be inside the handler at once to pass the barrier.
    let (broker, listener) = start(Arc::default(), 2).await;
    let (queue, mut replies) = reply_queue(&broker).await;

    send(&broker, &queue, "a", request("Greet", "Greet.Rendezvous", "a"), None).await;
    send(&broker, &queue, "b", request("Greet", "Greet.Rendezvous", "b"), None).await;

    let (first, _) = receive(&mut replies).await;
    let (second, _) = receive(&mut replies).await;

    assert!(first.status.is_ok());
    assert!(second.status.is_ok());

    listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_twice_fails() {
    let (_broker, listener) = start(Arc::default(), 1).await;

    assert!(matches!(listener.start().await, Err(Error::AlreadyStarted)));

    listener.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_requeues_in_flight_call() {
    let greeter = Arc::new(Greeter::default());
    let (broker, listener) = start(Arc::clone(&greeter), 1).await;
    let (queue, mut replies) = reply_queue(&broker).await;

    send(
        &broker,
        &queue,
        "call-1",
        request("Greet", "Greet.WaitForCancel", ""),
        None,
    )
    .await;
    timeout(Duration::from_secs(5), greeter.started.notified())
        .await
        .unwrap();

    timeout(Duration::from_secs(5), listener.shutdown())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(broker.message_count(DEFAULT_REQUEST_QUEUE), Some(1));
    assert!(
        timeout(Duration::from_millis(200), replies.next())
            .await
            .is_err()
    );
}

/// Memory broker that refuses to open consumers once its allowance runs out.
#[derive(Clone, Debug)]
struct LimitedBroker {
    allowance: Arc<AtomicUsize>,
    inner: MemoryBroker,
}

#[async_trait]
impl Broker for LimitedBroker {
    type Error = MemoryError;

    async fn declare_queue(&self, options: QueueOptions) -> Result<String, Self::Error> {
        self.inner.declare_queue(options).await
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, Self::Error> {
        self.allowance
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| MemoryError::Closed)?;
        self.inner.consume(queue, options).await
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), Self::Error> {
        self.inner.publish(queue, message).await
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), Self::Error> {
        self.inner.delete_queue(queue).await
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_failed_start_leaves_no_workers_and_can_be_retried() {
    let broker = LimitedBroker {
        allowance: Arc::new(AtomicUsize::new(2)),
        inner: MemoryBroker::new(),
    };
    let listener = RpcListener::new(
        broker.clone(),
        Arc::new(registry(Arc::default())),
        ListenerOptions::default().with_workers(3),
    );

    assert!(matches!(listener.start().await, Err(Error::Broker(_))));
    assert_eq!(broker.inner.consumer_count(DEFAULT_REQUEST_QUEUE), Some(0));

    broker.allowance.store(usize::MAX, Ordering::SeqCst);
    listener.start().await.unwrap();
    assert_eq!(broker.inner.consumer_count(DEFAULT_REQUEST_QUEUE), Some(3));

    let (queue, mut replies) = reply_queue(&broker.inner).await;
    send(
        &broker.inner,
        &queue,
        "call-1",
        request("Greet", "Greet.SayHello", "again"),
        None,
    )
    .await;
    let (response, _) = receive(&mut replies).await;
    assert_eq!(response.body.as_deref(), Some(&b"Hello again"[..]));

    listener.shutdown().await.unwrap();
    assert_eq!(broker.inner.consumer_count(DEFAULT_REQUEST_QUEUE), Some(0));
}
