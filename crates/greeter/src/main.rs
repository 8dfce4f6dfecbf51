//! Serves or calls the demo services over a message broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

use error::{Error, Result};

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use mqrpc_broker::Broker;
use mqrpc_broker_memory::MemoryBroker;
use mqrpc_broker_nats::NatsBroker;
use mqrpc_client::{CallOptions, ChannelOptions, RpcChannel};
use mqrpc_greeter::messages::{FibRequest, HelloRequest};
use mqrpc_greeter::services::{self, fib, say_hello};
use mqrpc_server::{ListenerOptions, RpcListener};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BrokerKind {
    /// In-process broker; only useful with `demo`.
    Memory,
    /// NATS server at `--nats-url`.
    Nats,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, env = "MQRPC_BROKER", value_enum, default_value_t = BrokerKind::Memory)]
    broker: BrokerKind,

    #[arg(long, env = "MQRPC_NATS_URL", default_value = "nats://localhost:4222")]
    nats_url: String,

    /// Request queue
    #[arg(long, env = "MQRPC_QUEUE", default_value = "rpc_queue")]
    queue: String,

    /// Call timeout in milliseconds
    #[arg(long, env = "MQRPC_TIMEOUT_MS", default_value_t = 5_000)]
    timeout_ms: u64,

    /// Listener workers
    #[arg(long, env = "MQRPC_WORKERS", default_value_t = 4)]
    workers: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo services until interrupted.
    Serve,

    /// Call Greet.SayHello.
    Hello {
        #[arg(default_value = "GreeterClient")]
        name: String,
    },

    /// Call Fibonacci.Fib.
    Fib {
        #[arg(default_value_t = 10)]
        max: u32,
    },

    /// Serve and call in one process.
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.broker {
        BrokerKind::Memory => run(MemoryBroker::new(), &args).await,
        BrokerKind::Nats => {
            let broker = NatsBroker::connect(&args.nats_url)
                .await
                .map_err(|e| Error::Broker(e.to_string()))?;
            run(broker, &args).await
        }
    }
}

async fn run<B: Broker>(broker: B, args: &Args) -> Result<()> {
    match &args.command {
        Command::Serve => {
            let listener = listen(broker.clone(), args).await?;
            tokio::signal::ctrl_c().await?;
            listener.shutdown().await?;
        }
        Command::Hello { name } => hello(broker.clone(), args, name).await?,
        Command::Fib { max } => fibonacci(broker.clone(), args, *max).await?,
        Command::Demo => {
            let listener = listen(broker.clone(), args).await?;
            hello(broker.clone(), args, "GreeterClient").await?;
            if let Err(e) = hello(broker.clone(), args, "nobody").await {
                warn!("{}", e);
            }
            fibonacci(broker.clone(), args, 20).await?;
            listener.shutdown().await?;
        }
    }

    broker
        .close()
        .await
        .map_err(|e| Error::Broker(e.to_string()))
}

async fn listen<B: Broker>(broker: B, args: &Args) -> Result<RpcListener<B>> {
    let listener = RpcListener::new(
        broker,
        Arc::new(services::registry()?),
        ListenerOptions::default()
            .with_queue(&args.queue)
            .with_workers(args.workers),
    );
    listener.start().await?;

    Ok(listener)
}

async fn channel<B: Broker>(broker: B, args: &Args) -> Result<RpcChannel<B>> {
    let options = ChannelOptions::default()
        .with_queue(&args.queue)
        .with_user_id("mqrpc-greeter");

    Ok(RpcChannel::connect(broker, options).await?)
}

fn call_options(args: &Args) -> CallOptions {
    CallOptions::new().with_timeout(Duration::from_millis(args.timeout_ms))
}

async fn hello<B: Broker>(broker: B, args: &Args, name: &str) -> Result<()> {
    let channel = channel(broker, args).await?;
    let request = HelloRequest {
        name: name.to_string(),
    };

    let reply = channel
        .unary_call(&say_hello(), &request, call_options(args))
        .await;
    channel.shutdown().await?;

    info!("{}", reply?.message);
    Ok(())
}

async fn fibonacci<B: Broker>(broker: B, args: &Args, max: u32) -> Result<()> {
    let channel = channel(broker, args).await?;

    let reply = channel
        .unary_call(&fib(), &FibRequest { max }, call_options(args))
        .await;
    channel.shutdown().await?;

    info!("fib({}) = {}", max, reply?.number);
    Ok(())
}
