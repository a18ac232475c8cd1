//! Appointment records and the vocabulary of a negotiation
use super::clock::TimeStamp;
use super::error::NegotiationError;
use std::fmt;

#[derive(
    minicbor::Encode,
    minicbor::Decode,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[cbor(index_only)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[n(0)]
    Store,
    #[n(1)]
    FreeBarber,
    #[n(2)]
    Customer,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Store, Role::FreeBarber, Role::Customer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Store => "store",
            Role::FreeBarber => "freebarber",
            Role::Customer => "customer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
#[cbor(index_only)]
pub enum Requester {
    #[n(0)]
    CustomerInitiated,
    #[n(1)]
    StoreInitiated,
}

/// Negotiation variant. `Direct` is a plain request with no venue phase.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cbor(index_only)]
pub enum SelectionType {
    #[default]
    #[n(0)]
    Direct,
    #[n(1)]
    CustomRequest,
    #[n(2)]
    StoreSelection,
}

#[derive(
    minicbor::Encode, minicbor::Decode, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[cbor(index_only)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    #[n(0)]
    Pending,
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
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Approved => "approved",
            AppointmentStatus::Rejected => "rejected",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Unanswered => "unanswered",
        }
    }
    /// No transition of any kind leaves this status.
    pub fn is_final(&self) -> bool {
        !matches!(
            self,
            AppointmentStatus::Pending | AppointmentStatus::Approved
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    minicbor::Encode, minicbor::Decode, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[cbor(index_only)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    NoAnswer,
}

impl DecisionStatus {
    /// Wire code used in notification payloads.
    pub fn code(&self) -> u8 {
        match self {
            DecisionStatus::Pending => 0,
            DecisionStatus::Approved => 1,
            DecisionStatus::Rejected => 2,
            DecisionStatus::NoAnswer => 3,
        }
    }
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(DecisionStatus::Pending),
            1 => Some(DecisionStatus::Approved),
            2 => Some(DecisionStatus::Rejected),
            3 => Some(DecisionStatus::NoAnswer),
            _ => None,
        }
    }
    pub fn is_resolved(&self) -> bool {
        *self != DecisionStatus::Pending
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecisionStatus::Pending => "pending",
            DecisionStatus::Approved => "approved",
            DecisionStatus::Rejected => "rejected",
            DecisionStatus::NoAnswer => "no answer",
        };
        f.write_str(name)
    }
}

/// Post-booking outcome set outside the decision protocol.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
#[cbor(index_only)]
pub enum Closure {
    #[n(0)]
    Cancelled,
    #[n(1)]
    Completed,
}

/// Who takes part. A `None` entry means the role has no standing.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct Parties {
    #[n(0)]
    pub store: Option<String>,
    #[n(1)]
    pub free_barber: Option<String>,
    #[n(2)]
    pub customer: Option<String>,
}

impl Parties {
    pub fn get(&self, role: Role) -> Option<&str> {
        match role {
            Role::Store => self.store.as_deref(),
            Role::FreeBarber => self.free_barber.as_deref(),
            Role::Customer => self.customer.as_deref(),
        }
    }
    pub fn has(&self, role: Role) -> bool {
        self.get(role).is_some()
    }
    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        Role::ALL.into_iter().filter(|r| self.has(*r))
    }
}

/// Per-role verdicts; only participants carry an entry.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct Decisions {
    #[n(0)]
    store: Option<DecisionStatus>,
    #[n(1)]
    free_barber: Option<DecisionStatus>,
    #[n(2)]
    customer: Option<DecisionStatus>,
}

impl Decisions {
    pub fn get(&self, role: Role) -> Option<DecisionStatus> {
        match role {
            Role::Store => self.store,
            Role::FreeBarber => self.free_barber,
            Role::Customer => self.customer,
        }
    }
    pub(crate) fn set(&mut self, role: Role, decision: DecisionStatus) {
        let slot = match role {
            Role::Store => &mut self.store,
            Role::FreeBarber => &mut self.free_barber,
            Role::Customer => &mut self.customer,
        };
        *slot = Some(decision);
    }
    pub fn iter(&self) -> impl Iterator<Item = (Role, DecisionStatus)> + '_ {
        Role::ALL
            .into_iter()
            .filter_map(|r| self.get(r).map(|d| (r, d)))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum HistoryEvent {
    #[n(0)]
    Created,
    #[n(1)]
    Decided {
        #[n(0)]
        approve: bool,
    },
    #[n(2)]
    StoreAttached {
        #[n(0)]
        store_id: String,
    },
    #[n(3)]
    Expired,
    #[n(4)]
    Cancelled,
    #[n(5)]
    Completed,
}

impl fmt::Display for HistoryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryEvent::Created => f.write_str("created"),
            HistoryEvent::Decided { approve: true } => f.write_str("approved"),
            HistoryEvent::Decided { approve: false } => f.write_str("rejected"),
            HistoryEvent::StoreAttached { store_id } => write!(f, "attached store {store_id}"),
            HistoryEvent::Expired => f.write_str("expired"),
            HistoryEvent::Cancelled => f.write_str("cancelled"),
            HistoryEvent::Completed => f.write_str("completed"),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    #[n(0)]
    pub at: TimeStamp,
    #[n(1)]
    pub role: Option<Role>, // None for clock-driven events
    #[n(2)]
    pub event: HistoryEvent,
}

/// Read access shared by live appointments and snapshots rebuilt from
/// notification payloads. Expiry and visibility rules are written against
/// this so they evaluate both the same way.
pub trait NegotiationView {
    fn appointment_id(&self) -> &str;
    fn requester(&self) -> Requester;
    fn selection(&self) -> SelectionType;
    fn created_at(&self) -> TimeStamp;
    fn pending_expires_at(&self) -> Option<TimeStamp>;
    fn parties(&self) -> &Parties;
    fn decisions(&self) -> &Decisions;
    fn status(&self) -> AppointmentStatus;

    fn store_attached(&self) -> bool {
        self.parties().store.is_some()
    }
    fn decision(&self, role: Role) -> Option<DecisionStatus> {
        self.decisions().get(role)
    }
    /// The single decision maker of a non store-selection negotiation.
    fn decider(&self) -> Option<Role> {
        decider_for(self.requester(), self.selection(), self.parties())
    }
    /// The role whose move it is while the appointment is pending.
    fn awaiting(&self) -> Option<Role> {
        if self.status() != AppointmentStatus::Pending {
            return None;
        }
        match self.selection() {
            SelectionType::StoreSelection => {
                if !self.store_attached() {
                    Some(Role::FreeBarber)
                } else if self.decision(Role::Store) == Some(DecisionStatus::Approved) {
                    Some(Role::Customer)
                } else {
                    Some(Role::Store)
                }
            }
            _ => self.decider(),
        }
    }
}

pub(crate) fn decider_for(
    requester: Requester,
    selection: SelectionType,
    parties: &Parties,
) -> Option<Role> {
    if selection == SelectionType::StoreSelection {
        return None;
    }
    let preference = match requester {
        Requester::CustomerInitiated => [Role::Store, Role::FreeBarber],
        Requester::StoreInitiated => [Role::FreeBarber, Role::Customer],
    };
    preference.into_iter().find(|r| parties.has(*r))
}

/// Status as a function of the recorded decisions. Nothing else feeds it
/// except an explicit post-booking closure.
pub(crate) fn derive_status(
    requester: Requester,
    selection: SelectionType,
    parties: &Parties,
    decisions: &Decisions,
    closure: Option<Closure>,
) -> AppointmentStatus {
    match closure {
        Some(Closure::Cancelled) => return AppointmentStatus::Cancelled,
        Some(Closure::Completed) => return AppointmentStatus::Completed,
        None => {}
    }
    if decisions.iter().any(|(_, d)| d == DecisionStatus::Rejected) {
        return AppointmentStatus::Rejected;
    }
    if decisions.iter().any(|(_, d)| d == DecisionStatus::NoAnswer) {
        return AppointmentStatus::Unanswered;
    }
    let approved = |r: Role| decisions.get(r) == Some(DecisionStatus::Approved);
    let finalised = match selection {
        SelectionType::StoreSelection => approved(Role::Store) && approved(Role::Customer),
        _ => decider_for(requester, selection, parties).is_some_and(approved),
    };
    if finalised {
        AppointmentStatus::Approved
    } else {
        AppointmentStatus::Pending
    }
}

/// The unit of negotiation. Mutated only through the transition methods in
/// [`crate::engine`].
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Appointment {
    #[n(0)]
    pub(crate) id: String,
    #[n(1)]
    pub(crate) requester: Requester,
    #[n(2)]
    pub(crate) selection: SelectionType,
    #[n(3)]
    pub(crate) created_at: TimeStamp,
    #[n(4)]
    pub(crate) pending_expires_at: Option<TimeStamp>,
    #[n(5)]
    pub(crate) parties: Parties,
    #[n(6)]
    pub(crate) decisions: Decisions,
    #[n(7)]
    pub(crate) note: Option<String>,
    #[n(8)]
    pub(crate) closure: Option<Closure>,
    #[n(9)]
    pub(crate) history: Vec<HistoryEntry>,
}

impl Appointment {
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }
    pub(crate) fn record(&mut self, at: TimeStamp, role: Option<Role>, event: HistoryEvent) {
        self.history.push(HistoryEntry { at, role, event });
    }
    /// Human readable audit trail, one line per recorded event.
    pub fn view_history(&self) -> String {
        let mut out = format!("History for appointment: {}\n", self.id);
        for (i, entry) in self.history.iter().enumerate() {
            let who = entry.role.map_or("clock", |r| r.as_str());
            out.push_str(&format!("  {}. {} by {who} at {}\n", i + 1, entry.event, entry.at));
        }
        out.push_str(&format!("Current status: {}", self.status()));
        out
    }
}

impl NegotiationView for Appointment {
    fn appointment_id(&self) -> &str {
        &self.id
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
    fn status(&self) -> AppointmentStatus {
        derive_status(
            self.requester,
            self.selection,
            &self.parties,
            &self.decisions,
            self.closure,
        )
    }
}

// Used for constructing new requests before they become appointments
#[derive(Debug, Clone)]
pub struct AppointmentRequest {
    requester: Requester,
    selection: SelectionType,
    parties: Parties,
    note: Option<String>,
}

impl AppointmentRequest {
    pub fn new(requester: Requester) -> Self {
        Self {
            requester,
            selection: SelectionType::Direct,
            parties: Parties::default(),
            note: None,
        }
    }
    pub fn set_selection(mut self, selection: SelectionType) -> Self {
        self.selection = selection;
        self
    }
    pub fn set_customer(mut self, customer_id: &str) -> Self {
        self.parties.customer = Some(customer_id.to_string());
        self
    }
    pub fn set_free_barber(mut self, free_barber_id: &str) -> Self {
        self.parties.free_barber = Some(free_barber_id.to_string());
        self
    }
    pub fn set_store(mut self, store_id: &str) -> Self {
        self.parties.store = Some(store_id.to_string());
        self
    }
    pub fn set_note(mut self, note: &str) -> Self {
        self.note = Some(note.to_string());
        self
    }

    /// Checks the party layout against the negotiation variant and seeds the
    /// initial decisions.
    pub fn build(self, id: String, created_at: TimeStamp) -> Result<Appointment, NegotiationError> {
        let invalid = |msg: &str| Err(NegotiationError::InvalidRequest(msg.into()));

        let requesting_role = match self.requester {
            Requester::CustomerInitiated => Role::Customer,
            Requester::StoreInitiated => Role::Store,
        };
        if !self.parties.has(requesting_role) {
            return invalid("the requesting party is missing");
        }

        let mut decisions = Decisions::default();
        match self.selection {
            SelectionType::StoreSelection => {
                if self.requester != Requester::CustomerInitiated {
                    return invalid("store selection must be requested by a customer");
                }
                if !self.parties.has(Role::FreeBarber) {
                    return invalid("store selection needs a free barber");
                }
                if self.parties.has(Role::Store) {
                    return invalid("store selection cannot name a store up front");
                }
                decisions.set(Role::FreeBarber, DecisionStatus::Pending);
                decisions.set(Role::Customer, DecisionStatus::Pending);
            }
            _ => {
                if self.note.is_some() {
                    return invalid("notes are only accepted on store selection requests");
                }
                let Some(decider) = decider_for(self.requester, self.selection, &self.parties)
                else {
                    return invalid("nobody is in a position to answer the request");
                };
                for role in self.parties.roles() {
                    let initial = if role == decider {
                        DecisionStatus::Pending
                    } else {
                        DecisionStatus::Approved
                    };
                    decisions.set(role, initial);
                }
            }
        }

        let mut appointment = Appointment {
            id,
            requester: self.requester,
            selection: self.selection,
            created_at,
            pending_expires_at: None,
            parties: self.parties,
            decisions,
            note: self.note,
            closure: None,
            history: vec![],
        };
        appointment.record(created_at, Some(requesting_role), HistoryEvent::Created);

        Ok(appointment)
    }
}
