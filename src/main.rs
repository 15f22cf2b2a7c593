use anyhow::Result;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ara_mq::config::Settings;
use ara_mq::{create_message_queer, handler_fn, ConsumeOptions, Context};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!(
        transport = ?settings.transport,
        driver = ?settings.driver,
        mode = ?settings.run_mode(),
        "Configuration loaded"
    );

    let queer = create_message_queer(&settings)?;

    queer.register_handler(handler_fn(|_ctx, msg| async move {
        tracing::info!(
            id = ?msg.id,
            topic = ?msg.topic,
            attempt = msg.attempt,
            headers = msg.header.len(),
            bytes = msg.body.len(),
            "Message received"
        );
        msg.ack();
        Ok(())
    }))?;

    let ctx = Context::background();

    let consumer = if settings.run_mode().can_consume() {
        let queer = queer.clone();
        let ctx = ctx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = queer.consume(&ctx, ConsumeOptions::default()).await {
                tracing::error!(error = %e, "Consumer stopped with error");
            }
        }))
    } else {
        tracing::info!("Consume disabled, client is publish-only");
        None
    };

    shutdown_signal().await;

    // Stop accepting deliveries and wait for in-flight handlers
    queer.graceful_stop().await?;
    ctx.cancel();

    if let Some(handle) = consumer {
        let _ = handle.await;
    }

    tracing::info!(transport = queer.transport(), "Shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
