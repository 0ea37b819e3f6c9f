//! messaging-server entry point.
//!
//! Runs the listeners against an in-process broker, seeded with a few
//! demo messages, until Ctrl-C. On shutdown prints the shutdown report and
//! the message counters as JSON.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use messaging_server::broker::FactoryProvider;
use messaging_server::broker::memory::InMemoryBroker;
use messaging_server::config::MessagingConfig;
use messaging_server::domain::BrokerMessage;
use messaging_server::server::MessagingServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load configuration
    let config = MessagingConfig::from_env()?;
    tracing::info!(her_id = config.her_id, workers = config.total_workers(), "starting messaging-server");

    // Wire connections
    let broker = InMemoryBroker::new();
    let factories: Vec<Arc<dyn FactoryProvider>> = (0..config.max_factories)
        .map(|_| broker.factory() as Arc<dyn FactoryProvider>)
        .collect();
    let shutdown_timeout = config.shutdown_timeout;
    let server = MessagingServer::builder(config).factories(factories).build()?;

    register_hooks(&server);
    seed(&broker, server.config());

    server.start()?;
    tracing::info!("listening, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let report = server.stop(shutdown_timeout).await?;
    let summary = serde_json::json!({
        "shutdown": report,
        "stats": server.stats(),
        "listeners": server.listeners(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

fn register_hooks(server: &MessagingServer) {
    server.register_async_received(|message| {
        tracing::info!(
            message_id = %message.message_id,
            function = %message.message_function,
            bytes = message.payload.len(),
            "asynchronous message"
        );
        Ok(())
    });
    server.register_sync_received(|message| {
        tracing::info!(message_id = %message.message_id, "synchronous request");
        Ok(message.payload.clone())
    });
    server.register_error_received(|message| {
        tracing::warn!(
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            "delivery failure reported by broker"
        );
        Ok(())
    });
    server.register_handled_exception(|message, err| {
        tracing::warn!(message_id = %message.message_id, error = %err, "handled exception");
    });
    server.register_unhandled_exception(|message, err| {
        tracing::error!(message_id = %message.message_id, error = %err, "unhandled exception");
    });
}

fn seed(broker: &InMemoryBroker, config: &MessagingConfig) {
    let her_id = config.her_id.max(1);
    for n in 0..3 {
        broker.enqueue(
            &config.asynchronous.queue_name,
            BrokerMessage::new(format!("demo-async-{n}"), b"<demo/>".to_vec())
                .with_routing("DEMO", her_id, her_id),
        );
    }
    broker.enqueue(
        &config.synchronous.queue_name,
        BrokerMessage::new("demo-sync-0", b"<ping/>".to_vec())
            .with_routing("DEMO", her_id, her_id)
            .with_reply_to(format!("{her_id}_reply")),
    );
    broker.enqueue(
        &config.error.queue_name,
        BrokerMessage::new("demo-error-0", Vec::new()),
    );
}
