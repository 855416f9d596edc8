//! CLI commands for FleetMQ using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::RequestBridge;
use crate::broker::{Delivery, MemoryBroker};
use crate::config::load_settings;
use crate::consumer::{
    AckingHandler, ConnectionSupervisor, Consumer, InProcessTransport, Topology,
};

/// FleetMQ - in-memory message broker for distributed agent fleets.
#[derive(Parser)]
#[command(name = "fleetmq")]
#[command(version = "0.1.0")]
#[command(about = "FleetMQ - volatile best-effort broker for agent fleets", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a broker until Ctrl+C
    Serve,

    /// In-process request/response round-trip sanity check
    Ping {
        /// How long to wait for the echoed response, in milliseconds
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },

    /// Print the effective settings
    Settings,
}

impl Commands {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Serve => run_serve().await,
            Command::Ping { timeout_ms } => run_ping(*timeout_ms).await,
            Command::Settings => run_settings(),
        }
    }
}

async fn run_serve() -> Result<()> {
    let settings = load_settings()?;
    let broker = MemoryBroker::new(settings);

    broker.start().await;
    tracing::info!("Broker serving; press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    broker.stop().await;
    Ok(())
}

/// Echo consumer backing the `ping` command.
struct EchoConsumer {
    broker: Arc<MemoryBroker>,
    exchange: String,
}

#[async_trait::async_trait]
impl Consumer for EchoConsumer {
    fn routing_key(&self) -> &str {
        "fleet.ping"
    }

    async fn consume(&self, delivery: Delivery) -> crate::error::Result<()> {
        let Some((routing_key, properties)) = delivery.response_route() else {
            return Ok(());
        };
        self.broker.basic_publish(
            &self.exchange,
            &routing_key,
            false,
            false,
            properties,
            delivery.body,
        )
    }
}

async fn run_ping(timeout_ms: u64) -> Result<()> {
    let settings = load_settings()?;
    let exchange = settings.exchange.clone();
    let reconnect_delay = settings.reconnect_delay();
    let prefetch = settings.prefetch_count;

    let broker = MemoryBroker::new(settings);
    broker.start().await;

    let consumer = Arc::new(EchoConsumer {
        broker: broker.clone(),
        exchange: exchange.clone(),
    });
    let supervisor = ConnectionSupervisor::new(
        InProcessTransport::new(broker.clone()),
        Topology::for_consumer(&exchange, "ping", consumer.routing_key()),
        AckingHandler::new(consumer),
        prefetch,
        reconnect_delay,
    );
    supervisor.clone().start_consuming().await;

    let bridge = RequestBridge::new(broker.clone(), format!("{}:ping:replies", exchange));

    let started = Instant::now();
    let response = bridge
        .blocking_publish(
            "fleet.ping",
            b"ping".to_vec(),
            Duration::from_millis(timeout_ms),
        )
        .await?;
    println!(
        "round-trip ok: {} bytes in {} ms",
        response.len(),
        started.elapsed().as_millis()
    );

    supervisor.terminate().await;
    broker.stop().await;
    Ok(())
}

fn run_settings() -> Result<()> {
    let settings = load_settings()?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
