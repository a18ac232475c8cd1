//! Turns loosely typed notification payloads into a strict snapshot.
//!
//! Producers have emitted decision fields as absent/null, as booleans and as
//! integer codes over time. Only the integer codes (and their names) are
//! trusted; a boolean says nothing reliable about *which* verdict was meant,
//! so it reads as pending and the role is listed in
//! [`AppointmentSnapshot::unknown_decisions`].
use super::appointment::{
    AppointmentStatus, DecisionStatus, Decisions, NegotiationView, Parties, Requester, Role,
    SelectionType, derive_status,
};
use super::clock::TimeStamp;
use super::error::NormalizeError;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentSnapshot {
    pub appointment_id: String,
    pub requester: Requester,
    pub selection: SelectionType,
    pub status: AppointmentStatus,
    pub created_at: TimeStamp,
    pub pending_expires_at: Option<TimeStamp>,
    pub parties: Parties,
    pub decisions: Decisions,
    pub note: Option<String>,
    pub unknown_decisions: Vec<Role>,
}

impl NegotiationView for AppointmentSnapshot {
    fn appointment_id(&self) -> &str {
        &self.appointment_id
    }
    fn requester(&self) -> Requester {
        self.requester
    }
    fn selection(&self) -> SelectionType {
        self.selection
    }
    fn created_at(&self) -> TimeStamp {
        self.created_at
    }
    fn pending_expires_at(&self) -> Option<TimeStamp> {
        self.pending_expires_at
    }
    fn parties(&self) -> &Parties {
        &self.parties
    }
    fn decisions(&self) -> &Decisions {
        &self.decisions
    }
    // as recorded at emission time, which may be stale
    fn status(&self) -> AppointmentStatus {
        self.status
    }
}

/// Shape of a single decision field as it arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawDecision {
    Absent,
    Known(DecisionStatus),
    Unknown,
}

pub fn classify_decision(value: Option<&Value>) -> RawDecision {
    match value {
        None | Some(Value::Null) => RawDecision::Absent,
        Some(Value::Bool(_)) => RawDecision::Unknown,
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(DecisionStatus::from_code)
            .map_or(RawDecision::Unknown, RawDecision::Known),
        Some(Value::String(s)) => match token(s).as_str() {
            "pending" => RawDecision::Known(DecisionStatus::Pending),
            "approved" => RawDecision::Known(DecisionStatus::Approved),
            "rejected" => RawDecision::Known(DecisionStatus::Rejected),
            "noanswer" => RawDecision::Known(DecisionStatus::NoAnswer),
            _ => RawDecision::Unknown,
        },
        Some(_) => RawDecision::Unknown,
    }
}

pub fn normalize(raw: &Value) -> Result<AppointmentSnapshot, NormalizeError> {
    let obj = raw.as_object().ok_or(NormalizeError::NotAnObject)?;

    let appointment_id = text(obj, "appointmentId")
        .ok_or(NormalizeError::MissingField("appointmentId"))?
        .to_string();
    let created_at = timestamp(obj, "createdAt")?.ok_or(NormalizeError::MissingField("createdAt"))?;
    let pending_expires_at = timestamp(obj, "pendingExpiresAt")?;
    let requester = requester(obj)?;
    let selection = selection(obj)?;

    let parties = Parties {
        store: text(obj, "storeId").map(str::to_string),
        free_barber: text(obj, "freeBarberId").map(str::to_string),
        customer: text(obj, "customerId").map(str::to_string),
    };

    let mut decisions = Decisions::default();
    let mut unknown_decisions = vec![];
    for (role, key) in [
        (Role::Store, "storeDecision"),
        (Role::FreeBarber, "freeBarberDecision"),
        (Role::Customer, "customerDecision"),
    ] {
        let field = classify_decision(obj.get(key));
        if !parties.has(role) {
            if field != RawDecision::Absent {
                tracing::debug!(appointment_id = %appointment_id, %role, "ignoring decision of a non participant");
            }
            continue;
        }
        let decision = match field {
            RawDecision::Known(decision) => decision,
            RawDecision::Absent => DecisionStatus::Pending,
            RawDecision::Unknown => {
                tracing::debug!(appointment_id = %appointment_id, %role, value = ?obj.get(key), "untrusted decision field");
                unknown_decisions.push(role);
                DecisionStatus::Pending
            }
        };
        decisions.set(role, decision);
    }

    let status = match obj.get("status") {
        None | Some(Value::Null) => derive_status(requester, selection, &parties, &decisions, None),
        Some(value) => status(value)?,
    };

    Ok(AppointmentSnapshot {
        appointment_id,
        requester,
        selection,
        status,
        created_at,
        pending_expires_at,
        parties,
        decisions,
        note: text(obj, "note").map(str::to_string),
        unknown_decisions,
    })
}

// case and separator insensitive enum token
fn token(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn text<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn timestamp(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<TimeStamp>, NormalizeError> {
    let invalid = |value: &Value| NormalizeError::InvalidTimestamp {
        field,
        value: value.to_string(),
    };
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value @ Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(TimeStamp::from(dt.with_timezone(&Utc))))
            .map_err(|_| invalid(value)),
        Some(value @ Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| Some(TimeStamp::from(dt)))
            .ok_or_else(|| invalid(value)),
        Some(value) => Err(invalid(value)),
    }
}

fn unknown(field: &'static str, value: &Value) -> NormalizeError {
    NormalizeError::UnknownValue {
        field,
        value: value.to_string(),
    }
}

fn requester(obj: &Map<String, Value>) -> Result<Requester, NormalizeError> {
    let Some(value) = obj.get("requester").filter(|v| !v.is_null()) else {
        return Ok(Requester::CustomerInitiated);
    };
    match (value.as_str().map(token), value.as_u64()) {
        (Some(t), _) if t == "customer" || t == "customerinitiated" => {
            Ok(Requester::CustomerInitiated)
        }
        (Some(t), _) if t == "store" || t == "storeinitiated" => Ok(Requester::StoreInitiated),
        (_, Some(0)) => Ok(Requester::CustomerInitiated),
        (_, Some(1)) => Ok(Requester::StoreInitiated),
        _ => Err(unknown("requester", value)),
    }
}

fn selection(obj: &Map<String, Value>) -> Result<SelectionType, NormalizeError> {
    let Some(value) = obj.get("storeSelectionType").filter(|v| !v.is_null()) else {
        return Ok(SelectionType::Direct);
    };
    match (value.as_str().map(token), value.as_u64()) {
        (Some(t), _) if t == "none" || t == "direct" => Ok(SelectionType::Direct),
        (Some(t), _) if t == "customrequest" => Ok(SelectionType::CustomRequest),
        (Some(t), _) if t == "storeselection" => Ok(SelectionType::StoreSelection),
        (_, Some(0)) => Ok(SelectionType::Direct),
        (_, Some(1)) => Ok(SelectionType::CustomRequest),
        (_, Some(2)) => Ok(SelectionType::StoreSelection),
        _ => Err(unknown("storeSelectionType", value)),
    }
}

fn status(value: &Value) -> Result<AppointmentStatus, NormalizeError> {
    const ORDER: [AppointmentStatus; 6] = [
        AppointmentStatus::Pending,
        AppointmentStatus::Approved,
        AppointmentStatus::Rejected,
        AppointmentStatus::Cancelled,
        AppointmentStatus::Completed,
        AppointmentStatus::Unanswered,
    ];
    if let Some(code) = value.as_u64() {
        return ORDER
            .get(code as usize)
            .copied()
            .ok_or_else(|| unknown("status", value));
    }
    let t = value.as_str().map(token).ok_or_else(|| unknown("status", value))?;
    ORDER
        .into_iter()
        .find(|s| s.as_str() == t)
        .ok_or_else(|| unknown("status", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Value {
        json!({
            "appointmentId": "appt_1",
            "createdAt": "2025-03-01T09:00:00Z",
            "customerId": "cust",
            "storeId": "store",
        })
    }

    #[test]
    fn classifies_the_three_encodings() {
        assert_eq!(classify_decision(None), RawDecision::Absent);
        assert_eq!(classify_decision(Some(&Value::Null)), RawDecision::Absent);
        assert_eq!(classify_decision(Some(&json!(true))), RawDecision::Unknown);
        assert_eq!(classify_decision(Some(&json!(false))), RawDecision::Unknown);
        assert_eq!(
            classify_decision(Some(&json!(2))),
            RawDecision::Known(DecisionStatus::Rejected)
        );
        assert_eq!(classify_decision(Some(&json!(7))), RawDecision::Unknown);
        assert_eq!(
            classify_decision(Some(&json!("No_Answer"))),
            RawDecision::Known(DecisionStatus::NoAnswer)
        );
    }

    #[test]
    fn derives_status_when_missing() {
        let mut raw = base();
        raw["storeDecision"] = json!(1);

        let snapshot = normalize(&raw).unwrap();
        assert_eq!(snapshot.status, AppointmentStatus::Approved);
        assert_eq!(snapshot.decision(Role::Customer), Some(DecisionStatus::Pending));
    }

    #[test]
    fn accepts_integer_enums_and_epoch_millis() {
        let mut raw = base();
        raw["status"] = json!(5);
        raw["storeSelectionType"] = json!(1);
        raw["requester"] = json!(0);
        raw["createdAt"] = json!(1_740_819_600_000_i64);

        let snapshot = normalize(&raw).unwrap();
        assert_eq!(snapshot.status, AppointmentStatus::Unanswered);
        assert_eq!(snapshot.selection, SelectionType::CustomRequest);
        assert_eq!(
            snapshot.created_at,
            TimeStamp::new_with(2025, 3, 1, 9, 0, 0)
        );
    }

    #[test]
    fn rejects_unusable_payloads() {
        assert_eq!(normalize(&json!([1, 2])), Err(NormalizeError::NotAnObject));
        assert_eq!(
            normalize(&json!({"createdAt": "2025-03-01T09:00:00Z"})),
            Err(NormalizeError::MissingField("appointmentId"))
        );

        let mut raw = base();
        raw["status"] = json!("maybe");
        assert!(matches!(
            normalize(&raw),
            Err(NormalizeError::UnknownValue { field: "status", .. })
        ));

        let mut raw = base();
        raw["createdAt"] = json!("yesterday");
        assert!(matches!(
            normalize(&raw),
            Err(NormalizeError::InvalidTimestamp { .. })
        ));
    }
}
