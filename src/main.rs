use anyhow::{Context, Result};
use rabbit_courier::{
    ClientConfig, ConnectionManager, Incoming, MessageQueueClient, RpcClient, RpcMethod, RpcServer,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ECHO_QUEUE: &str = "echo";

#[derive(Debug, Serialize, Deserialize)]
struct DoubleRequest {
    value: i64,
}

struct Double;

impl RpcMethod for Double {
    type Request = DoubleRequest;
    type Response = i64;

    fn queue() -> &'static str {
        "double"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ClientConfig::load()?;
    let manager = ConnectionManager::from_config(&config);
    let channel = manager
        .acquire_channel()
        .await
        .context("Broker is unavailable, not starting")?;

    let args: Vec<String> = std::env::args().collect();
    let outcome = match args.get(1).map(|s| s.as_str()) {
        Some("serve") => serve(channel).await,
        Some("call") => {
            let value = args.get(2).map(|v| v.parse()).transpose()?.unwrap_or(21);
            let client = RpcClient::new(channel);
            let doubled = client
                .invoke::<Double>(&DoubleRequest { value }, config.rpc_timeout())
                .await?;
            info!(value, doubled, "RPC call completed");
            Ok(())
        }
        Some("send") => {
            let text = args.get(2).cloned().unwrap_or_else(|| "ping".to_string());
            MessageQueueClient::new(channel).send(ECHO_QUEUE, &text).await?;
            Ok(())
        }
        _ => {
            println!("Usage: rabbit-courier [serve|call <value>|send <text>]");
            Ok(())
        }
    };

    manager.close().await?;
    outcome
}

async fn serve(channel: lapin::Channel) -> Result<()> {
    let server = RpcServer::new(channel.clone());
    let rpc_task = tokio::spawn(async move {
        server
            .serve::<Double, _, _>(|request: DoubleRequest| async move {
                request
                    .value
                    .checked_mul(2)
                    .context("value out of range")
            })
            .await
    });

    let mq = MessageQueueClient::new(channel);
    let echo_task = tokio::spawn(async move {
        mq.consume(
            ECHO_QUEUE,
            |message: Incoming| async move {
                match message.decode::<String>() {
                    Ok(text) => info!(redelivered = message.redelivered, "Echo: {}", text),
                    Err(e) => error!("Echo message is not a string: {}", e),
                }
                if let Err(e) = message.ack().await {
                    error!("Failed to acknowledge echo message: {}", e);
                }
            },
            false,
        )
        .await
    });

    info!("Service running. Press Ctrl+C to exit.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        result = rpc_task => error!("RPC server stopped: {:?}", result),
        result = echo_task => error!("Echo consumer stopped: {:?}", result),
    }
    Ok(())
}
