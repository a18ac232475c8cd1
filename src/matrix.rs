//! What a given viewer may do with an appointment, and what they are shown.
//!
//! One pure function replaces the per-screen flag soup: given the
//! negotiation state (live, or rebuilt from a notification payload), the
//! notification being looked at and the viewer's role, [`evaluate`] returns
//! the permitted actions together with the outcome to display.
use super::appointment::{AppointmentStatus, DecisionStatus, NegotiationView, Role, SelectionType};
use super::clock::TimeStamp;
use super::notification::NotificationType;
use super::policy::ExpiryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Actions {
    None,
    ApproveReject,
    /// Decline only; acceptance happens through choosing a venue.
    RejectOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Outcome {
    /// Still open. The viewer either acts now or is waiting on someone else.
    Open,
    /// The viewer has answered while the appointment is still nominally
    /// pending.
    OwnDecision(DecisionStatus),
    Settled(AppointmentStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Verdict {
    pub actions: Actions,
    pub outcome: Outcome,
}

impl Verdict {
    fn settled(status: AppointmentStatus) -> Self {
        Self {
            actions: Actions::None,
            outcome: Outcome::Settled(status),
        }
    }
    fn open(actions: Actions) -> Self {
        Self {
            actions,
            outcome: Outcome::Open,
        }
    }
}

/// `notification` is `None` when rendering live state outside of any
/// notification; that reads like the initial request.
pub fn evaluate(
    appt: &impl NegotiationView,
    notification: Option<NotificationType>,
    viewer: Role,
    now: &TimeStamp,
    policy: &ExpiryPolicy,
) -> Verdict {
    if let Some(status) = notification.and_then(|n| n.announced_status()) {
        return Verdict::settled(status);
    }
    let status = appt.status();
    if status != AppointmentStatus::Pending {
        return Verdict::settled(status);
    }
    let Some(own) = appt.decision(viewer) else {
        return Verdict::open(Actions::None);
    };
    if own.is_resolved() {
        return Verdict {
            actions: Actions::None,
            outcome: Outcome::OwnDecision(own),
        };
    }
    if policy
        .expiry_deadline(appt)
        .is_some_and(|deadline| *now >= deadline)
    {
        return Verdict::settled(AppointmentStatus::Unanswered);
    }

    let kind = notification.unwrap_or(NotificationType::Created);
    let approved = |role: Role| appt.decision(role) == Some(DecisionStatus::Approved);

    let actions = match appt.selection() {
        SelectionType::StoreSelection => match viewer {
            Role::FreeBarber
                if !appt.store_attached()
                    && !approved(Role::Customer)
                    && kind == NotificationType::Created =>
            {
                Actions::RejectOnly
            }
            Role::Store if appt.store_attached() && kind == NotificationType::Created => {
                Actions::ApproveReject
            }
            Role::Customer
                if approved(Role::Store)
                    && matches!(
                        kind,
                        NotificationType::Created | NotificationType::StoreApprovedSelection
                    ) =>
            {
                Actions::ApproveReject
            }
            _ => Actions::None,
        },
        _ if appt.decider() == Some(viewer) && kind == NotificationType::Created => {
            Actions::ApproveReject
        }
        _ => Actions::None,
    };

    Verdict::open(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appointment::{Appointment, AppointmentRequest, Requester};
    use chrono::Duration;

    fn t0() -> TimeStamp {
        TimeStamp::new_with(2025, 3, 1, 9, 0, 0)
    }
    fn at(mins: i64) -> TimeStamp {
        t0().plus(Duration::minutes(mins))
    }

    fn store_selection() -> Appointment {
        AppointmentRequest::new(Requester::CustomerInitiated)
            .set_selection(SelectionType::StoreSelection)
            .set_customer("cust")
            .set_free_barber("barber")
            .build("appt_m".into(), t0())
            .unwrap()
    }

    #[test]
    fn barber_may_only_decline_before_venue() {
        let policy = ExpiryPolicy::default();
        let appt = store_selection();

        let verdict = evaluate(
            &appt,
            Some(NotificationType::Created),
            Role::FreeBarber,
            &at(10),
            &policy,
        );
        assert_eq!(verdict.actions, Actions::RejectOnly);

        // customer is still waiting, nothing to press yet
        let verdict = evaluate(&appt, None, Role::Customer, &at(10), &policy);
        assert_eq!(verdict, Verdict::open(Actions::None));
    }

    #[test]
    fn store_then_customer_get_buttons() {
        let policy = ExpiryPolicy::default();
        let mut appt = store_selection();
        appt.attach_store("store", &at(5), &policy).unwrap();

        let store_view = evaluate(
            &appt,
            Some(NotificationType::Created),
            Role::Store,
            &at(6),
            &policy,
        );
        assert_eq!(store_view.actions, Actions::ApproveReject);

        appt.decide(Role::Store, true, &at(6), &policy).unwrap();
        let customer_view = evaluate(
            &appt,
            Some(NotificationType::StoreApprovedSelection),
            Role::Customer,
            &at(7),
            &policy,
        );
        assert_eq!(customer_view.actions, Actions::ApproveReject);

        let store_after = evaluate(&appt, None, Role::Store, &at(7), &policy);
        assert_eq!(
            store_after.outcome,
            Outcome::OwnDecision(DecisionStatus::Approved)
        );
        assert_eq!(store_after.actions, Actions::None);
    }

    #[test]
    fn status_notifications_never_offer_actions() {
        let policy = ExpiryPolicy::default();
        let appt = store_selection();

        let verdict = evaluate(
            &appt,
            Some(NotificationType::Rejected),
            Role::FreeBarber,
            &at(1),
            &policy,
        );
        assert_eq!(verdict, Verdict::settled(AppointmentStatus::Rejected));
    }

    #[test]
    fn lapsed_deadline_shows_unanswered() {
        let policy = ExpiryPolicy::default();
        let appt = AppointmentRequest::new(Requester::CustomerInitiated)
            .set_customer("cust")
            .set_store("store")
            .build("appt_n".into(), t0())
            .unwrap();

        let verdict = evaluate(&appt, None, Role::Store, &at(5), &policy);
        assert_eq!(verdict, Verdict::settled(AppointmentStatus::Unanswered));
    }

    #[test]
    fn non_participant_sees_nothing() {
        let policy = ExpiryPolicy::default();
        let appt = store_selection();

        let verdict = evaluate(&appt, None, Role::Store, &at(1), &policy);
        assert_eq!(verdict.actions, Actions::None);
    }
}
