//! Expiry timers for pending appointments.
//!
//! One one-shot timer per pending appointment, armed at its current
//! deadline and re-armed whenever a transition moves that deadline. Firing
//! goes through [`NegotiationService::expire`], which re-checks the deadline
//! under the appointment lock, so a timer that fires late, early or twice
//! is harmless. A periodic sweep picks up anything a lost timer missed.
use super::bus::NegotiationEvent;
use super::clock::{Clock, TimeStamp};
use super::config::NegotiationConfig;
use super::engine::Expiry;
use super::error::is_not_found;
use super::service::NegotiationService;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

struct Timer {
    deadline: TimeStamp,
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct ExpiryScheduler {
    service: Arc<NegotiationService>,
    clock: Arc<dyn Clock>,
    retry_delays: Vec<Duration>,
    sweep_interval: Duration,
    timers: Mutex<HashMap<String, Timer>>,
    generation: AtomicU64,
}

impl ExpiryScheduler {
    pub fn new(
        service: Arc<NegotiationService>,
        clock: Arc<dyn Clock>,
        config: &NegotiationConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            clock,
            retry_delays: config.expiry_retry_delays.clone(),
            sweep_interval: config.sweep_interval,
            timers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    /// Arm, move or drop the timer for an appointment. `None` means nothing
    /// is pending any more.
    pub fn track(self: &Arc<Self>, appointment_id: &str, deadline: Option<TimeStamp>) {
        let Some(deadline) = deadline else {
            self.cancel(appointment_id);
            return;
        };

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if timers
            .get(appointment_id)
            .is_some_and(|timer| timer.deadline == deadline && !timer.handle.is_finished())
        {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(Arc::clone(self).run_timer(appointment_id.to_string(), deadline, generation));
        if let Some(previous) = timers.insert(
            appointment_id.to_string(),
            Timer {
                deadline,
                generation,
                handle,
            },
        ) {
            previous.handle.abort();
        }
        tracing::debug!(appointment_id, %deadline, "expiry timer armed");
    }

    pub fn cancel(&self, appointment_id: &str) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = timers.remove(appointment_id) {
            timer.handle.abort();
            tracing::debug!(appointment_id, "expiry timer dropped");
        }
    }

    pub fn scheduled_count(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn deadline_of(&self, appointment_id: &str) -> Option<TimeStamp> {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(appointment_id)
            .map(|timer| timer.deadline)
    }

    // removes the entry only if no newer timer replaced it meanwhile
    fn forget(&self, appointment_id: &str, generation: u64) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if timers
            .get(appointment_id)
            .is_some_and(|timer| timer.generation == generation)
        {
            timers.remove(appointment_id);
        }
    }

    async fn run_timer(self: Arc<Self>, appointment_id: String, mut deadline: TimeStamp, generation: u64) {
        loop {
            tokio::time::sleep(deadline.remaining_from(&self.clock.now())).await;

            match self.expire_with_retry(&appointment_id).await {
                // woke before the clock reached the deadline
                Some(Expiry::NotDue(next)) => deadline = next,
                _ => break,
            }
        }
        self.forget(&appointment_id, generation);
    }

    /// Apply a due expiry, retrying transient failures with backoff. `None`
    /// when the appointment is gone or every attempt failed.
    async fn expire_with_retry(&self, appointment_id: &str) -> Option<Expiry> {
        let mut delays = self.retry_delays.iter();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let service = Arc::clone(&self.service);
            let target = appointment_id.to_string();
            let result = tokio::task::spawn_blocking(move || service.expire(&target))
                .await
                .map_err(anyhow::Error::from)
                .and_then(|r| r);

            match result {
                Ok(outcome) => return Some(outcome),
                Err(e) if is_not_found(&e) => {
                    tracing::debug!(appointment_id, "expiry target no longer exists");
                    return None;
                }
                Err(e) => match delays.next() {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            appointment_id,
                            error = %e,
                            "Expiry attempt failed, retrying"
                        );
                        tokio::time::sleep(*delay).await;
                    }
                    None => {
                        tracing::error!(appointment_id, error = %e, "Expiry failed after all retries");
                        return None;
                    }
                },
            }
        }
    }

    /// Expire every pending appointment already past its deadline. Returns
    /// how many were settled.
    pub async fn sweep(&self) -> anyhow::Result<usize> {
        let now = self.clock.now();
        let service = Arc::clone(&self.service);
        let overdue = tokio::task::spawn_blocking(move || service.pending_expiring(&now)).await??;

        let mut expired = 0;
        for appt in overdue {
            if let Some(Expiry::Expired(_)) = self.expire_with_retry(appt.id()).await {
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!(expired, "Expiry sweep: settled overdue appointments");
        } else {
            tracing::debug!("Expiry sweep: nothing overdue");
        }
        Ok(expired)
    }

    /// Re-arm timers for everything pending with a deadline at or before
    /// `before`. Used at startup and after missed bus events.
    pub fn recover(self: &Arc<Self>, before: &TimeStamp) -> anyhow::Result<usize> {
        let pending = self.service.pending_expiring(before)?;
        let policy = *self.service.policy();
        for appt in &pending {
            self.track(appt.id(), policy.expiry_deadline(appt));
        }
        tracing::info!(count = pending.len(), "Expiry timers recovered");
        Ok(pending.len())
    }

    /// Follow transitions on the bus and sweep on a fixed interval until the
    /// bus closes.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<NegotiationEvent>) {
        tracing::info!(
            interval_secs = self.sweep_interval.as_secs(),
            "Expiry scheduler started"
        );

        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(NegotiationEvent::Transitioned { appointment_id, expires_at, .. }) => {
                        self.track(&appointment_id, expires_at);
                    }
                    Ok(NegotiationEvent::Notified(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Expiry scheduler lagged behind the bus");
                        let horizon = self.service.policy().horizon(&self.clock.now());
                        if let Err(e) = self.recover(&horizon) {
                            tracing::error!(error = %e, "Expiry scheduler: recovery failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        tracing::info!("Expiry scheduler stopping");
                        break;
                    }
                },
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Expiry sweep failed");
                    }
                }
            }
        }
    }
}
