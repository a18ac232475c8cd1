//! State transitions applied to a single appointment.
//!
//! Every method validates fully before touching the record, so a failed
//! call leaves the appointment exactly as it was. Callers are expected to
//! hold the appointment's serialization point (see `service`).
use super::appointment::{
    Appointment, AppointmentStatus, Closure, DecisionStatus, HistoryEvent, NegotiationView, Role,
    SelectionType,
};
use super::clock::TimeStamp;
use super::error::NegotiationError;
use super::notification::{Emission, NotificationType};
use super::policy::ExpiryPolicy;

/// Result of an applied transition: the new status and who must hear of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: AppointmentStatus,
    pub emissions: Vec<Emission>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    Expired(Transition),
    /// Deadline not reached yet; carries the deadline in force.
    NotDue(TimeStamp),
    /// Already out of `Pending`; expiring is a no-op.
    Settled(AppointmentStatus),
}

impl Appointment {
    pub fn decide(
        &mut self,
        role: Role,
        approve: bool,
        now: &TimeStamp,
        policy: &ExpiryPolicy,
    ) -> Result<Transition, NegotiationError> {
        let current = self
            .decisions
            .get(role)
            .ok_or(NegotiationError::NotParticipant(role))?;
        let status = self.status();
        let store_selection = self.selection == SelectionType::StoreSelection;

        // the customer's window in a store selection only opens on store approval
        if store_selection
            && role == Role::Customer
            && self.decisions.get(Role::Store) != Some(DecisionStatus::Approved)
        {
            return Err(NegotiationError::InvalidTransition(
                "final confirmation needs the store's approval first".into(),
            ));
        }
        if matches!(
            status,
            AppointmentStatus::Pending | AppointmentStatus::Unanswered
        ) && policy.is_expired(self, role, now)
        {
            return Err(NegotiationError::Expired {
                role,
                deadline: policy.deadline(self, role),
            });
        }
        if current.is_resolved() {
            return Err(NegotiationError::AlreadyDecided {
                role,
                decision: current,
            });
        }
        if status != AppointmentStatus::Pending {
            return Err(NegotiationError::InvalidTransition(format!(
                "appointment is {status}, not pending"
            )));
        }
        if store_selection && role == Role::FreeBarber && approve {
            return Err(NegotiationError::InvalidTransition(
                "a free barber accepts a store selection request by choosing a venue".into(),
            ));
        }
        if !store_selection && self.decider() != Some(role) {
            return Err(NegotiationError::InvalidTransition(format!(
                "{role} does not answer this request"
            )));
        }

        let verdict = if approve {
            DecisionStatus::Approved
        } else {
            DecisionStatus::Rejected
        };
        self.decisions.set(role, verdict);
        self.record(*now, Some(role), HistoryEvent::Decided { approve });

        // store approval hands over to the customer with a fresh window
        if store_selection && role == Role::Store && approve {
            self.pending_expires_at = Some(policy.fresh_window(now));
            return Ok(Transition {
                status: self.status(),
                emissions: vec![Emission {
                    notification_type: NotificationType::StoreApprovedSelection,
                    recipient: Role::Customer,
                }],
            });
        }

        let status = self.status();
        let emissions = match status {
            AppointmentStatus::Approved => self.announce(NotificationType::Approved, Some(role)),
            AppointmentStatus::Rejected => self.announce(NotificationType::Rejected, Some(role)),
            _ => vec![],
        };
        Ok(Transition { status, emissions })
    }

    /// Venue chosen by the free barber of a store selection request. Counts
    /// as the barber's acceptance and opens the store's decision.
    pub fn attach_store(
        &mut self,
        store_id: &str,
        now: &TimeStamp,
        policy: &ExpiryPolicy,
    ) -> Result<Transition, NegotiationError> {
        if self.selection != SelectionType::StoreSelection {
            return Err(NegotiationError::InvalidTransition(
                "only store selection requests take a venue".into(),
            ));
        }
        if self.store_attached() {
            return Err(NegotiationError::InvalidTransition(
                "a venue is already attached".into(),
            ));
        }
        if self.decisions.get(Role::FreeBarber) == Some(DecisionStatus::Rejected) {
            return Err(NegotiationError::InvalidTransition(
                "the free barber declined this request".into(),
            ));
        }
        let status = self.status();
        if status != AppointmentStatus::Pending {
            return Err(NegotiationError::InvalidTransition(format!(
                "appointment is {status}, not pending"
            )));
        }
        if policy.is_expired(self, Role::FreeBarber, now) {
            return Err(NegotiationError::Expired {
                role: Role::FreeBarber,
                deadline: policy.deadline(self, Role::FreeBarber),
            });
        }
        if store_id.trim().is_empty() {
            return Err(NegotiationError::InvalidRequest("store id is empty".into()));
        }

        self.parties.store = Some(store_id.to_string());
        self.decisions.set(Role::FreeBarber, DecisionStatus::Approved);
        self.decisions.set(Role::Store, DecisionStatus::Pending);
        self.pending_expires_at = Some(policy.fresh_window(now));
        self.record(
            *now,
            Some(Role::FreeBarber),
            HistoryEvent::StoreAttached {
                store_id: store_id.to_string(),
            },
        );

        Ok(Transition {
            status: self.status(),
            emissions: vec![Emission {
                notification_type: NotificationType::Created,
                recipient: Role::Store,
            }],
        })
    }

    pub fn expire(&mut self, now: &TimeStamp, policy: &ExpiryPolicy) -> Expiry {
        let status = self.status();
        if status != AppointmentStatus::Pending {
            return Expiry::Settled(status);
        }
        let Some(deadline) = policy.expiry_deadline(self) else {
            return Expiry::Settled(status);
        };
        if *now < deadline {
            return Expiry::NotDue(deadline);
        }

        for role in Role::ALL {
            if self.decisions.get(role) == Some(DecisionStatus::Pending) {
                self.decisions.set(role, DecisionStatus::NoAnswer);
            }
        }
        self.record(*now, None, HistoryEvent::Expired);

        Expiry::Expired(Transition {
            status: self.status(),
            emissions: self.announce(NotificationType::Unanswered, None),
        })
    }

    pub fn cancel(&mut self, role: Role, now: &TimeStamp) -> Result<Transition, NegotiationError> {
        self.close(role, Closure::Cancelled, now)
    }

    pub fn complete(&mut self, role: Role, now: &TimeStamp) -> Result<Transition, NegotiationError> {
        self.close(role, Closure::Completed, now)
    }

    fn close(
        &mut self,
        role: Role,
        closure: Closure,
        now: &TimeStamp,
    ) -> Result<Transition, NegotiationError> {
        if !self.parties.has(role) {
            return Err(NegotiationError::NotParticipant(role));
        }
        let status = self.status();
        if status != AppointmentStatus::Approved {
            return Err(NegotiationError::InvalidTransition(format!(
                "only approved appointments can be closed, this one is {status}"
            )));
        }

        let (event, notification_type) = match closure {
            Closure::Cancelled => (HistoryEvent::Cancelled, NotificationType::Cancelled),
            Closure::Completed => (HistoryEvent::Completed, NotificationType::Completed),
        };
        self.closure = Some(closure);
        self.record(*now, Some(role), event);

        Ok(Transition {
            status: self.status(),
            emissions: self.announce(notification_type, Some(role)),
        })
    }

    // everyone taking part except whoever caused the transition
    fn announce(&self, notification_type: NotificationType, actor: Option<Role>) -> Vec<Emission> {
        self.parties
            .roles()
            .filter(|r| Some(*r) != actor)
            .map(|recipient| Emission {
                notification_type,
                recipient,
            })
            .collect()
    }
}
