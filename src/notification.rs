//! Notifications emitted on transitions, and the payload snapshot they carry
use super::appointment::{
    Appointment, AppointmentStatus, NegotiationView, Requester, Role, SelectionType,
};
use super::clock::TimeStamp;
use super::ids;
use super::policy::ExpiryPolicy;
use serde_json::{Map, Value, json};

#[derive(
    minicbor::Encode, minicbor::Decode, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[cbor(index_only)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    #[n(0)]
    Created,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Cancelled,
    #[n(4)]
    Completed,
    #[n(5)]
    Unanswered,
    #[n(6)]
    StoreApprovedSelection,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Created => "created",
            NotificationType::Approved => "approved",
            NotificationType::Rejected => "rejected",
            NotificationType::Cancelled => "cancelled",
            NotificationType::Completed => "completed",
            NotificationType::Unanswered => "unanswered",
            NotificationType::StoreApprovedSelection => "store_approved_selection",
        }
    }

    /// Status carried by a status-type notification. These never offer
    /// actions, whatever decisions the payload embeds.
    pub fn announced_status(&self) -> Option<AppointmentStatus> {
        match self {
            NotificationType::Approved => Some(AppointmentStatus::Approved),
            NotificationType::Rejected => Some(AppointmentStatus::Rejected),
            NotificationType::Cancelled => Some(AppointmentStatus::Cancelled),
            NotificationType::Completed => Some(AppointmentStatus::Completed),
            NotificationType::Unanswered => Some(AppointmentStatus::Unanswered),
            NotificationType::Created | NotificationType::StoreApprovedSelection => None,
        }
    }
}

/// One notification owed to one recipient as the result of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emission {
    pub notification_type: NotificationType,
    pub recipient: Role,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    #[n(0)]
    pub id: String, // content derived, see ids::notification_id
    #[n(1)]
    pub appointment_id: String,
    #[n(2)]
    pub notification_type: NotificationType,
    #[n(3)]
    pub recipient_role: Role,
    #[n(4)]
    pub recipient_id: Option<String>,
    #[n(5)]
    pub is_read: bool,
    #[n(6)]
    pub created_at: TimeStamp,
    #[n(7)]
    pub payload: String, // JSON snapshot at emission time
}

impl Notification {
    pub fn emit(
        appt: &Appointment,
        emission: &Emission,
        policy: &ExpiryPolicy,
        now: TimeStamp,
    ) -> anyhow::Result<Self> {
        let sequence = appt.history().len() as u64;
        let id = ids::notification_id(
            appt.id(),
            sequence,
            emission.notification_type.as_str(),
            emission.recipient.as_str(),
        )?;
        let mut snapshot = snapshot_payload(appt, policy);
        if let (Some(note), Some(fields)) = (appt.note(), snapshot.as_object_mut()) {
            fields.insert("note".into(), json!(note));
        }
        let payload = serde_json::to_string(&snapshot)?;

        Ok(Self {
            id,
            appointment_id: appt.id().to_string(),
            notification_type: emission.notification_type,
            recipient_role: emission.recipient,
            recipient_id: appt.parties().get(emission.recipient).map(str::to_string),
            is_read: false,
            created_at: now,
            payload,
        })
    }

    pub fn payload_json(&self) -> anyhow::Result<Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(minicbor::to_vec(self)?)
    }

    /// Returns whether anything changed.
    pub(crate) fn mark_read(&mut self) -> bool {
        !std::mem::replace(&mut self.is_read, true)
    }
}

/// Renders the negotiation state the way producers put it on the wire.
pub fn snapshot_payload(appt: &impl NegotiationView, policy: &ExpiryPolicy) -> Value {
    let status = appt.status();
    let mut payload = Map::new();

    payload.insert("appointmentId".into(), json!(appt.appointment_id()));
    payload.insert(
        "requester".into(),
        json!(match appt.requester() {
            Requester::CustomerInitiated => "customer",
            Requester::StoreInitiated => "store",
        }),
    );
    payload.insert(
        "storeSelectionType".into(),
        json!(match appt.selection() {
            SelectionType::Direct => "none",
            SelectionType::CustomRequest => "custom_request",
            SelectionType::StoreSelection => "store_selection",
        }),
    );
    payload.insert("status".into(), json!(status.as_str()));
    payload.insert("createdAt".into(), json!(appt.created_at().to_rfc3339()));
    if status == AppointmentStatus::Pending {
        if let Some(deadline) = policy.expiry_deadline(appt) {
            payload.insert("pendingExpiresAt".into(), json!(deadline.to_rfc3339()));
        }
    }

    for (role, id_key, decision_key) in [
        (Role::Customer, "customerId", "customerDecision"),
        (Role::FreeBarber, "freeBarberId", "freeBarberDecision"),
        (Role::Store, "storeId", "storeDecision"),
    ] {
        if let Some(id) = appt.parties().get(role) {
            payload.insert(id_key.into(), json!(id));
        }
        if let Some(decision) = appt.decision(role) {
            payload.insert(decision_key.into(), json!(decision.code()));
        }
    }

    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appointment::AppointmentRequest;
    use chrono::Duration;

    #[test]
    fn payload_carries_deadline_only_while_pending() {
        let t0 = TimeStamp::new_with(2025, 3, 1, 9, 0, 0);
        let policy = ExpiryPolicy::default();
        let mut appt = AppointmentRequest::new(Requester::CustomerInitiated)
            .set_customer("cust")
            .set_store("store")
            .build("appt_p".into(), t0)
            .unwrap();

        let pending = snapshot_payload(&appt, &policy);
        assert_eq!(pending["status"], "pending");
        assert_eq!(pending["storeDecision"], 0);
        assert_eq!(pending["customerDecision"], 1);
        assert_eq!(
            pending["pendingExpiresAt"],
            t0.plus(Duration::minutes(5)).to_rfc3339()
        );
        assert!(pending.get("freeBarberId").is_none());

        appt.decide(Role::Store, true, &t0.plus(Duration::minutes(1)), &policy)
            .unwrap();
        let approved = snapshot_payload(&appt, &policy);
        assert_eq!(approved["status"], "approved");
        assert!(approved.get("pendingExpiresAt").is_none());
    }

    #[test]
    fn mark_read_is_idempotent() {
        let t0 = TimeStamp::new_with(2025, 3, 1, 9, 0, 0);
        let appt = AppointmentRequest::new(Requester::CustomerInitiated)
            .set_customer("cust")
            .set_store("store")
            .build("appt_q".into(), t0)
            .unwrap();
        let emission = Emission {
            notification_type: NotificationType::Created,
            recipient: Role::Store,
        };
        let mut notification =
            Notification::emit(&appt, &emission, &ExpiryPolicy::default(), t0).unwrap();

        assert_eq!(notification.recipient_id.as_deref(), Some("store"));
        assert!(notification.mark_read());
        assert!(!notification.mark_read());
        assert!(notification.is_read);
    }
}
