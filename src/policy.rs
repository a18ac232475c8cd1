//! Deadline computation for pending decisions
use super::appointment::{NegotiationView, Role, SelectionType};
use super::clock::TimeStamp;
use super::config::NegotiationConfig;
use chrono::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// Window for an ordinary approve/reject.
    pub decision_window: Duration,
    /// Window a free barber has to take on a store selection request before
    /// any venue exists.
    pub acceptance_window: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            decision_window: Duration::minutes(5),
            acceptance_window: Duration::minutes(30),
        }
    }
}

impl From<&NegotiationConfig> for ExpiryPolicy {
    fn from(config: &NegotiationConfig) -> Self {
        Self {
            decision_window: config.decision_window,
            acceptance_window: config.acceptance_window,
        }
    }
}

impl ExpiryPolicy {
    /// Deadline for `viewer`'s pending decision. A deadline carried on the
    /// appointment itself always wins over the computed one.
    pub fn deadline(&self, appt: &impl NegotiationView, viewer: Role) -> TimeStamp {
        if let Some(explicit) = appt.pending_expires_at() {
            return explicit;
        }
        let window = match appt.selection() {
            SelectionType::StoreSelection if viewer == Role::FreeBarber && !appt.store_attached() => {
                self.acceptance_window
            }
            _ => self.decision_window,
        };
        appt.created_at().plus(window)
    }

    /// Deadline of the appointment as a whole: that of whoever is being
    /// waited on. `None` once nothing is pending.
    pub fn expiry_deadline(&self, appt: &impl NegotiationView) -> Option<TimeStamp> {
        appt.awaiting().map(|role| self.deadline(appt, role))
    }

    pub fn is_expired(&self, appt: &impl NegotiationView, role: Role, now: &TimeStamp) -> bool {
        *now >= self.deadline(appt, role)
    }

    /// A fresh window starting at `now`, used when a phase hands over to the
    /// next decider.
    pub fn fresh_window(&self, now: &TimeStamp) -> TimeStamp {
        now.plus(self.decision_window)
    }

    /// Latest deadline any appointment pending at `now` can have.
    pub fn horizon(&self, now: &TimeStamp) -> TimeStamp {
        now.plus(self.decision_window.max(self.acceptance_window))
    }
}
