use std::sync::Arc;

use appointment_negotiation::bus::{EventBus, NegotiationEvent};
use appointment_negotiation::clock::{Clock, SystemClock};
use appointment_negotiation::config::NegotiationConfig;
use appointment_negotiation::scheduler::ExpiryScheduler;
use appointment_negotiation::service::NegotiationService;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "appointment_negotiation=info,negotiation_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = NegotiationConfig::from_env()?;
    tracing::info!(
        db = %config.database_path.display(),
        decision_window_secs = config.decision_window.num_seconds(),
        acceptance_window_secs = config.acceptance_window.num_seconds(),
        "Loaded negotiation configuration"
    );

    // --- Storage ---
    let db = Arc::new(sled::open(&config.database_path)?);
    tracing::info!("Appointment store opened");

    // --- Event bus ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = Arc::new(EventBus::default());

    let service = Arc::new(
        NegotiationService::new(Arc::clone(&db), Arc::clone(&clock), &config)
            .with_bus(Arc::clone(&bus)),
    );

    // --- Expiry scheduler ---
    let scheduler = ExpiryScheduler::new(Arc::clone(&service), Arc::clone(&clock), &config);
    let horizon = service.policy().horizon(&clock.now());
    scheduler.recover(&horizon)?;
    let scheduler_handle = tokio::spawn(Arc::clone(&scheduler).run(bus.subscribe()));

    // Delivery collaborators subscribe here; the worker itself only logs.
    let delivery_handle = tokio::spawn(log_notifications(bus.subscribe()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    scheduler_handle.abort();
    delivery_handle.abort();
    db.flush()?;
    tracing::info!("Appointment store flushed");

    Ok(())
}

async fn log_notifications(mut events: tokio::sync::broadcast::Receiver<NegotiationEvent>) {
    loop {
        match events.recv().await {
            Ok(NegotiationEvent::Notified(notification)) => tracing::info!(
                notification_id = %notification.id,
                appointment_id = %notification.appointment_id,
                kind = notification.notification_type.as_str(),
                recipient = %notification.recipient_role,
                "Notification ready for delivery"
            ),
            Ok(NegotiationEvent::Transitioned { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Notification log lagged behind the bus");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
