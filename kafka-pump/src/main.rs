//! Consume a Kafka topic and log every record through the transport pump.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use envconfig::Envconfig;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use kafka_pump::config::Config;
use kafka_pump::health::HealthRegistry;
use kafka_pump::kafka::KafkaClientFactory;
use kafka_pump::metrics::{serve, setup_metrics_router};
use kafka_pump::{DispatchPipeline, MessageContext, PumpState, TransportPump};

/// Logs each record and completes it.
struct LoggingPipeline;

#[async_trait]
impl DispatchPipeline for LoggingPipeline {
    async fn dispatch(&self, message: MessageContext) -> Result<()> {
        info!(
            message_id = message.message_id(),
            topic = message.topic_partition().topic(),
            partition = message.topic_partition().partition(),
            offset = message.offset(),
            bytes = message.body().len(),
            headers = message.headers().len(),
            "Received message"
        );
        message.complete().await?;
        Ok(())
    }
}

async fn shutdown() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
    Ok(())
}

fn start_server(config: &Config, liveness: HealthRegistry) -> Result<JoinHandle<()>> {
    let router = setup_metrics_router(liveness).context("failed to install metrics recorder")?;
    let bind = config.bind();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics and health checks on {bind}: {e:#}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().context("Invalid configuration")?;

    let log_layer = {
        let base_layer = fmt::layer().with_target(true).with_level(true);
        match config.debug {
            true => base_layer
                .with_ansi(true)
                .with_filter(EnvFilter::from_default_env())
                .boxed(),
            false => base_layer
                .json()
                .with_filter(EnvFilter::from_default_env())
                .boxed(),
        }
    };
    tracing_subscriber::registry().with(log_layer).init();

    info!("Starting Kafka transport pump");

    let liveness = HealthRegistry::new("liveness");
    let pump_liveness = liveness.register("pump".to_string(), Duration::from_secs(60));

    let server_handle = start_server(&config, liveness)?;
    info!("Started metrics server on {}", config.bind());

    let options = config.to_pump_options()?;
    let shutdown_timeout = options.shutdown_timeout;
    let factory = Arc::new(KafkaClientFactory::new(config.kafka.clone()));
    let pump = TransportPump::new(options, factory, Arc::new(LoggingPipeline))?
        .with_liveness(pump_liveness);

    pump.start_pump()
        .await
        .context("Failed to start the pump. Check your Kafka connection and topic settings.")?;

    let mut state = pump.subscribe_state();
    let faulted = tokio::select! {
        result = shutdown() => {
            result?;
            false
        }
        result = state.wait_for(|state| *state == PumpState::Faulted) => result.is_ok(),
    };

    pump.stop_pump(shutdown_timeout).await;
    server_handle.abort();

    if faulted {
        anyhow::bail!("the pump stopped on a fatal broker error");
    }
    Ok(())
}
