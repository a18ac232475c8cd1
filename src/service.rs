//! Service layer API for negotiation commands.
//!
//! This is the single writer for appointment state. Every command for one
//! appointment runs under that appointment's lock: load, apply one
//! transition, persist the record and its notifications in one batch,
//! publish. Commands for different appointments never contend.
use super::appointment::{Appointment, AppointmentRequest, AppointmentStatus, NegotiationView, Role};
use super::bus::{EventBus, NegotiationEvent};
use super::clock::{Clock, TimeStamp};
use super::config::NegotiationConfig;
use super::engine::{Expiry, Transition};
use super::error::{ErrorKind, NegotiationError, is_not_found};
use super::ids;
use super::matrix::{self, Verdict};
use super::normalize::normalize;
use super::notification::{Emission, Notification, NotificationType};
use super::policy::ExpiryPolicy;
use anyhow::anyhow;
use sled::Batch;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

const APPOINTMENT_PREFIX: &str = "appt/";
const NOTIFICATION_PREFIX: &str = "ntf/";
const INDEX_PREFIX: &str = "idx/";
const DUE_PREFIX: &str = "due/";

fn appointment_key(id: &str) -> String {
    format!("{APPOINTMENT_PREFIX}{id}")
}
fn notification_key(id: &str) -> String {
    format!("{NOTIFICATION_PREFIX}{id}")
}
fn index_prefix(appointment_id: &str) -> String {
    format!("{INDEX_PREFIX}{appointment_id}/")
}

// Deadlines as zero padded epoch nanos so the byte order of keys is the
// chronological order.
fn due_nanos(deadline: &TimeStamp) -> u64 {
    deadline
        .to_datetime_utc()
        .timestamp_nanos_opt()
        .map_or(u64::MAX, |nanos| u64::try_from(nanos).unwrap_or(0))
}
fn due_key(deadline: &TimeStamp, appointment_id: &str) -> String {
    format!("{DUE_PREFIX}{:020}/{appointment_id}", due_nanos(deadline))
}
fn parse_due_key(key: &[u8]) -> Option<(u64, &str)> {
    let (nanos, appointment_id) = std::str::from_utf8(key)
        .ok()?
        .strip_prefix(DUE_PREFIX)?
        .split_once('/')?;
    Some((nanos.parse().ok()?, appointment_id))
}

/// Inbound decision command.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionCommand {
    pub appointment_id: String,
    pub role: Role,
    pub approve: bool,
}

/// Always definitive: either the decision was recorded, or it was not and
/// `error_kind` says why. `new_status` is where the appointment stands
/// afterwards (absent only when it does not exist).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResponse {
    pub success: bool,
    pub message: String,
    pub new_status: Option<AppointmentStatus>,
    pub error_kind: Option<ErrorKind>,
}

pub struct NegotiationService {
    instance: Arc<sled::Db>,
    clock: Arc<dyn Clock>,
    policy: ExpiryPolicy,
    bus: Option<Arc<EventBus>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NegotiationService {
    pub fn new(instance: Arc<sled::Db>, clock: Arc<dyn Clock>, config: &NegotiationConfig) -> Self {
        Self {
            instance,
            clock,
            policy: ExpiryPolicy::from(config),
            bus: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn policy(&self) -> &ExpiryPolicy {
        &self.policy
    }

    pub fn now(&self) -> TimeStamp {
        self.clock.now()
    }

    /// Load appointment from database
    fn load_appointment(&self, appointment_id: &str) -> anyhow::Result<Appointment> {
        let bytes = self
            .instance
            .get(appointment_key(appointment_id).as_bytes())?
            .ok_or_else(|| NegotiationError::NotFound(appointment_id.to_string()))?;
        Ok(minicbor::decode(&bytes)?)
    }

    pub fn get_appointment(&self, appointment_id: &str) -> anyhow::Result<Appointment> {
        self.load_appointment(appointment_id)
    }

    /// Pending appointments whose deadline falls at or before `before`,
    /// soonest first. Drives timer recovery and the overdue sweep.
    ///
    /// Walks the `due/` index only, so settled appointments are never read.
    /// A record that cannot be read is logged and skipped.
    pub fn pending_expiring(&self, before: &TimeStamp) -> anyhow::Result<Vec<Appointment>> {
        let limit = due_nanos(before);
        let mut due = vec![];
        for entry in self.instance.scan_prefix(DUE_PREFIX.as_bytes()) {
            let (key, _) = entry?;
            let Some((nanos, appointment_id)) = parse_due_key(&key) else {
                tracing::warn!(key = %String::from_utf8_lossy(&key), "skipping malformed deadline key");
                continue;
            };
            if nanos > limit {
                break;
            }
            match self.load_appointment(appointment_id) {
                Ok(appt) => {
                    if self
                        .policy
                        .expiry_deadline(&appt)
                        .is_some_and(|deadline| deadline <= *before)
                    {
                        due.push(appt);
                    }
                }
                Err(e) => {
                    tracing::warn!(appointment_id, error = %e, "skipping unreadable appointment");
                }
            }
        }
        Ok(due)
    }

    // Runs `op` as the only writer of this appointment.
    fn serialized<T>(
        &self,
        appointment_id: &str,
        op: impl FnOnce() -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| anyhow!("appointment lock table poisoned"))?;
            Arc::clone(locks.entry(appointment_id.to_string()).or_default())
        };
        let result = {
            // state lives in sled, a panicked holder cannot leave it half written
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            op()
        };
        self.release(appointment_id, &lock);
        result
    }

    // Drops the table entry once nobody else holds or waits on it. Clones
    // are only taken under the table lock, so a count of two (table and
    // caller) cannot grow while we check.
    fn release(&self, appointment_id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(lock) == 2 {
            locks.remove(appointment_id);
        }
    }

    /// Persist the appointment together with the notifications its
    /// transition owes, then tell subscribers.
    /// `previous_deadline` is the deadline in force before the transition,
    /// whose index entry is replaced.
    fn commit(
        &self,
        appt: &Appointment,
        transition: &Transition,
        previous_deadline: Option<TimeStamp>,
        now: TimeStamp,
    ) -> anyhow::Result<Vec<Notification>> {
        let notifications = transition
            .emissions
            .iter()
            .map(|emission| Notification::emit(appt, emission, &self.policy, now))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let deadline = self.policy.expiry_deadline(appt);

        // Batch insert: appointment, deadline index, notifications and their index entries
        let mut batch = Batch::default();
        batch.insert(appointment_key(appt.id()).as_bytes(), minicbor::to_vec(appt)?);
        if let Some(previous) = previous_deadline {
            batch.remove(due_key(&previous, appt.id()).as_bytes());
        }
        if let Some(deadline) = &deadline {
            batch.insert(due_key(deadline, appt.id()).as_bytes(), Vec::<u8>::new());
        }
        for notification in &notifications {
            batch.insert(
                notification_key(&notification.id).as_bytes(),
                notification.encode()?,
            );
            batch.insert(
                format!("{}{}", index_prefix(appt.id()), notification.id).as_bytes(),
                Vec::<u8>::new(),
            );
        }
        self.instance.apply_batch(batch)?;

        tracing::info!(
            appointment_id = %appt.id(),
            status = %transition.status,
            notifications = notifications.len(),
            "transition committed"
        );

        if let Some(bus) = &self.bus {
            bus.publish(NegotiationEvent::Transitioned {
                appointment_id: appt.id().to_string(),
                status: transition.status,
                expires_at: deadline,
            });
            for notification in &notifications {
                bus.publish(NegotiationEvent::Notified(notification.clone()));
            }
        }

        Ok(notifications)
    }

    // Load, apply one transition, save. The clock is read under the lock so
    // lateness is judged at the moment the command is applied.
    fn apply(
        &self,
        appointment_id: &str,
        transition: impl FnOnce(
            &mut Appointment,
            &TimeStamp,
            &ExpiryPolicy,
        ) -> Result<Transition, NegotiationError>,
    ) -> anyhow::Result<Appointment> {
        self.serialized(appointment_id, || {
            let mut appt = self.load_appointment(appointment_id)?;
            let now = self.clock.now();
            let previous_deadline = self.policy.expiry_deadline(&appt);

            let applied = transition(&mut appt, &now, &self.policy)?;
            self.commit(&appt, &applied, previous_deadline, now)?;
            Ok(appt)
        })
    }

    /// Submit a new appointment request for negotiation
    pub fn create_appointment(&self, request: AppointmentRequest) -> anyhow::Result<Appointment> {
        let id = ids::new_appointment_id()?;
        let now = self.clock.now();
        let appt = request.build(id, now)?;

        let emissions = appt
            .awaiting()
            .map(|recipient| Emission {
                notification_type: NotificationType::Created,
                recipient,
            })
            .into_iter()
            .collect();
        let transition = Transition {
            status: appt.status(),
            emissions,
        };
        self.commit(&appt, &transition, None, now)?;

        Ok(appt)
    }

    /// Attach the venue chosen for a store selection request
    pub fn attach_store(&self, appointment_id: &str, store_id: &str) -> anyhow::Result<Appointment> {
        self.apply(appointment_id, |appt, now, policy| {
            appt.attach_store(store_id, now, policy)
        })
    }

    /// Record `role`'s approve or reject
    pub fn decide(
        &self,
        appointment_id: &str,
        role: Role,
        approve: bool,
    ) -> anyhow::Result<Appointment> {
        self.apply(appointment_id, |appt, now, policy| {
            appt.decide(role, approve, now, policy)
        })
    }

    pub fn cancel(&self, appointment_id: &str, role: Role) -> anyhow::Result<Appointment> {
        self.apply(appointment_id, |appt, now, _| appt.cancel(role, now))
    }

    pub fn complete(&self, appointment_id: &str, role: Role) -> anyhow::Result<Appointment> {
        self.apply(appointment_id, |appt, now, _| appt.complete(role, now))
    }

    /// Mark the appointment unanswered if its deadline has passed. A no-op on
    /// anything already settled, so timers may fire late or twice.
    pub fn expire(&self, appointment_id: &str) -> anyhow::Result<Expiry> {
        self.serialized(appointment_id, || {
            let mut appt = self.load_appointment(appointment_id)?;
            let now = self.clock.now();
            let previous_deadline = self.policy.expiry_deadline(&appt);

            let outcome = appt.expire(&now, &self.policy);
            match &outcome {
                Expiry::Expired(transition) => {
                    self.commit(&appt, transition, previous_deadline, now)?;
                }
                Expiry::NotDue(deadline) => {
                    tracing::debug!(appointment_id, %deadline, "expiry not due yet");
                }
                Expiry::Settled(status) => {
                    tracing::debug!(appointment_id, %status, "expiry on settled appointment ignored");
                }
            }
            Ok(outcome)
        })
    }

    /// Decision command boundary. Never returns an ambiguous result: on
    /// failure the caller still learns where the appointment stands.
    pub fn handle_decision(&self, command: &DecisionCommand) -> DecisionResponse {
        let verb = if command.approve { "approval" } else { "rejection" };

        match self.decide(&command.appointment_id, command.role, command.approve) {
            Ok(appt) => {
                let status = appt.status();
                DecisionResponse {
                    success: true,
                    message: format!("{} {verb} recorded, appointment is {status}", command.role),
                    new_status: Some(status),
                    error_kind: None,
                }
            }
            Err(err) => {
                let kind = err
                    .downcast_ref::<NegotiationError>()
                    .map_or(ErrorKind::Internal, NegotiationError::kind);

                match kind {
                    ErrorKind::AlreadyDecided => tracing::debug!(
                        appointment_id = %command.appointment_id,
                        role = %command.role,
                        "repeated decision ignored"
                    ),
                    ErrorKind::Internal => tracing::error!(
                        appointment_id = %command.appointment_id,
                        error = %err,
                        "decision failed"
                    ),
                    _ => tracing::info!(
                        appointment_id = %command.appointment_id,
                        role = %command.role,
                        error = %err,
                        "decision refused"
                    ),
                }

                // a late decision settles the appointment rather than
                // waiting for its timer
                if kind == ErrorKind::Expired {
                    if let Err(expire_err) = self.expire(&command.appointment_id) {
                        tracing::warn!(
                            appointment_id = %command.appointment_id,
                            error = %expire_err,
                            "could not settle expired appointment"
                        );
                    }
                }

                let new_status = self
                    .load_appointment(&command.appointment_id)
                    .ok()
                    .map(|appt| appt.status());

                DecisionResponse {
                    success: false,
                    message: err.to_string(),
                    new_status,
                    error_kind: Some(kind),
                }
            }
        }
    }

    pub fn get_notification(&self, notification_id: &str) -> anyhow::Result<Notification> {
        let bytes = self
            .instance
            .get(notification_key(notification_id).as_bytes())?
            .ok_or_else(|| anyhow!("notification {notification_id} not found"))?;
        Ok(minicbor::decode(&bytes)?)
    }

    /// Every notification emitted for an appointment, oldest first.
    pub fn notifications_for(&self, appointment_id: &str) -> anyhow::Result<Vec<Notification>> {
        let prefix = index_prefix(appointment_id);
        let mut notifications = vec![];
        for entry in self.instance.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            let key = std::str::from_utf8(&key)?;
            let notification_id = key.strip_prefix(prefix.as_str()).unwrap_or(key);
            notifications.push(self.get_notification(notification_id)?);
        }
        notifications.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(notifications)
    }

    /// Read-state command. Idempotent and never touches the appointment.
    pub fn mark_read(&self, notification_id: &str) -> anyhow::Result<Notification> {
        let mut notification = self.get_notification(notification_id)?;
        if notification.mark_read() {
            self.instance.insert(
                notification_key(notification_id).as_bytes(),
                notification.encode()?,
            )?;
        }
        Ok(notification)
    }

    /// What the recipient of a notification may do and should see. Live
    /// state wins; the payload snapshot is only used once the appointment
    /// itself is gone.
    pub fn view_notification(&self, notification_id: &str) -> anyhow::Result<Verdict> {
        let notification = self.get_notification(notification_id)?;
        let now = self.clock.now();
        let kind = Some(notification.notification_type);
        let viewer = notification.recipient_role;

        match self.load_appointment(&notification.appointment_id) {
            Ok(live) => Ok(matrix::evaluate(&live, kind, viewer, &now, &self.policy)),
            Err(err) if is_not_found(&err) => {
                let snapshot = normalize(&notification.payload_json()?)?;
                Ok(matrix::evaluate(&snapshot, kind, viewer, &now, &self.policy))
            }
            Err(err) => Err(err),
        }
    }

    /// What `viewer` may do with the appointment right now.
    pub fn view_appointment(&self, appointment_id: &str, viewer: Role) -> anyhow::Result<Verdict> {
        let appt = self.load_appointment(appointment_id)?;
        Ok(matrix::evaluate(
            &appt,
            None,
            viewer,
            &self.clock.now(),
            &self.policy,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appointment::{Requester, SelectionType};
    use crate::clock::ManualClock;
    use chrono::Duration;
    use tempfile::tempdir;

    fn service_at(start: TimeStamp) -> (tempfile::TempDir, Arc<ManualClock>, NegotiationService) {
        let temp_dir = tempdir().unwrap();
        let db = sled::open(temp_dir.path().join("service_unit.db")).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let service =
            NegotiationService::new(Arc::new(db), clock.clone(), &NegotiationConfig::default());
        (temp_dir, clock, service)
    }

    #[test]
    fn lock_is_released_once_final() {
        let (_dir, clock, service) = service_at(TimeStamp::new_with(2025, 3, 1, 9, 0, 0));
        let appt = service
            .create_appointment(
                AppointmentRequest::new(Requester::CustomerInitiated)
                    .set_selection(SelectionType::CustomRequest)
                    .set_customer("cust")
                    .set_store("store"),
            )
            .unwrap();

        clock.advance(Duration::minutes(1));
        service.decide(appt.id(), Role::Store, false).unwrap();

        assert!(!service.locks.lock().unwrap().contains_key(appt.id()));
    }

    #[test]
    fn refused_commands_leave_no_lock_entries() {
        let (_dir, clock, service) = service_at(TimeStamp::new_with(2025, 3, 1, 9, 0, 0));

        for i in 0..100 {
            let response = service.handle_decision(&DecisionCommand {
                appointment_id: format!("bogus_{i}"),
                role: Role::Store,
                approve: true,
            });
            assert_eq!(response.error_kind, Some(ErrorKind::NotFound));
        }

        let appt = service
            .create_appointment(
                AppointmentRequest::new(Requester::CustomerInitiated)
                    .set_customer("cust")
                    .set_store("store"),
            )
            .unwrap();
        clock.advance(Duration::minutes(1));
        let reject = DecisionCommand {
            appointment_id: appt.id().to_string(),
            role: Role::Store,
            approve: false,
        };
        assert!(service.handle_decision(&reject).success);
        let repeat = service.handle_decision(&reject);
        assert_eq!(repeat.error_kind, Some(ErrorKind::AlreadyDecided));
        service.expire(appt.id()).unwrap();

        assert!(service.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn unreadable_record_does_not_stop_the_scan() {
        let t0 = TimeStamp::new_with(2025, 3, 1, 9, 0, 0);
        let (_dir, clock, service) = service_at(t0);

        let appt = service
            .create_appointment(
                AppointmentRequest::new(Requester::CustomerInitiated)
                    .set_customer("cust")
                    .set_store("store"),
            )
            .unwrap();

        // an earlier deadline pointing at garbage
        service
            .instance
            .insert(appointment_key("appt_broken").as_bytes(), vec![0xff, 0x00, 0x13])
            .unwrap();
        service
            .instance
            .insert(due_key(&t0, "appt_broken").as_bytes(), Vec::<u8>::new())
            .unwrap();

        clock.advance(Duration::minutes(6));
        let due = service.pending_expiring(&clock.now()).unwrap();
        let ids: Vec<&str> = due.iter().map(|a| a.id()).collect();
        assert_eq!(ids, vec![appt.id()]);
    }

    #[test]
    fn settled_appointments_leave_the_deadline_index() {
        let t0 = TimeStamp::new_with(2025, 3, 1, 9, 0, 0);
        let (_dir, clock, service) = service_at(t0);

        let appt = service
            .create_appointment(
                AppointmentRequest::new(Requester::CustomerInitiated)
                    .set_selection(SelectionType::StoreSelection)
                    .set_customer("cust")
                    .set_free_barber("barber"),
            )
            .unwrap();
        clock.advance(Duration::minutes(2));
        service.attach_store(appt.id(), "store").unwrap();

        // the acceptance deadline was replaced, not duplicated
        assert_eq!(service.instance.scan_prefix(DUE_PREFIX.as_bytes()).count(), 1);

        clock.advance(Duration::minutes(1));
        service.decide(appt.id(), Role::Store, false).unwrap();
        assert_eq!(service.instance.scan_prefix(DUE_PREFIX.as_bytes()).count(), 0);
        assert!(service.pending_expiring(&t0.plus(Duration::hours(1))).unwrap().is_empty());
    }

    #[test]
    fn pending_expiring_orders_by_deadline() {
        let t0 = TimeStamp::new_with(2025, 3, 1, 9, 0, 0);
        let (_dir, clock, service) = service_at(t0);

        let barber = service
            .create_appointment(
                AppointmentRequest::new(Requester::CustomerInitiated)
                    .set_selection(SelectionType::StoreSelection)
                    .set_customer("cust")
                    .set_free_barber("barber"),
            )
            .unwrap();
        clock.advance(Duration::minutes(1));
        let store = service
            .create_appointment(
                AppointmentRequest::new(Requester::CustomerInitiated)
                    .set_customer("cust")
                    .set_store("store"),
            )
            .unwrap();

        let soon = service
            .pending_expiring(&t0.plus(Duration::minutes(10)))
            .unwrap();
        assert_eq!(soon.len(), 1);
        assert_eq!(soon[0].id(), store.id());

        let all = service
            .pending_expiring(&t0.plus(Duration::hours(1)))
            .unwrap();
        let ids: Vec<&str> = all.iter().map(|a| a.id()).collect();
        assert_eq!(ids, vec![store.id(), barber.id()]);
    }
}
