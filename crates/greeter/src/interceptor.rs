use std::sync::Arc;

use async_trait::async_trait;
use mqrpc_core::{Code, Status};
use mqrpc_server::interceptor::UnaryContinuation;
use mqrpc_server::{AnyMessage, Interceptor, ServerCallContext};
use tokio::time::Instant;
use tracing::info;

/// Logs each unary call with its outcome and duration.
#[derive(Debug, Default)]
pub struct TimingInterceptor;

#[async_trait]
impl Interceptor for TimingInterceptor {
    async fn unary_server_handler(
        &self,
        request: AnyMessage,
        context: Arc<ServerCallContext>,
        next: UnaryContinuation,
    ) -> Result<Option<AnyMessage>, Status> {
        let method = context.method().full_name().to_string();
        let start = Instant::now();

        let response = next(request, context).await;

        let code = response.as_ref().map_or_else(Status::code, |_| Code::Ok);
        info!("{} finished with {} in {:?}", method, code, start.elapsed());

        response
    }
}
