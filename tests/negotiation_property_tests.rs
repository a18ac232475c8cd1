//! Property-based tests for the negotiation state machine
//!
//! Status is derived from the recorded decisions, so any bug in a transition
//! shows up as an impossible status sequence. These tests drive random
//! command sequences at random times through the engine and check the
//! invariants that must hold whatever order things arrive in.

use chrono::Duration;
use proptest::prelude::*;
use appointment_negotiation::{
    appointment::{
        Appointment, AppointmentRequest, AppointmentStatus, NegotiationView, Requester, Role,
        SelectionType,
    },
    clock::TimeStamp,
    engine::Expiry,
    error::NegotiationError,
    policy::ExpiryPolicy,
};

fn t0() -> TimeStamp {
    TimeStamp::new_with(2025, 3, 1, 9, 0, 0)
}

#[derive(Debug, Clone)]
enum Command {
    Decide(Role, bool),
    Attach,
    Expire,
    Cancel(Role),
    Complete(Role),
}

fn role_strategy() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::Store), Just(Role::FreeBarber), Just(Role::Customer)]
}

fn command_strategy() -> impl Strategy<Value = Command> {
    prop_oneof![
        4 => (role_strategy(), any::<bool>()).prop_map(|(r, a)| Command::Decide(r, a)),
        1 => Just(Command::Attach),
        2 => Just(Command::Expire),
        1 => role_strategy().prop_map(Command::Cancel),
        1 => role_strategy().prop_map(Command::Complete),
    ]
}

/// Every legal party layout for each negotiation variant
fn appointment_strategy() -> impl Strategy<Value = Appointment> {
    prop_oneof![
        Just(
            AppointmentRequest::new(Requester::CustomerInitiated)
                .set_customer("cust")
                .set_store("store")
        ),
        Just(
            AppointmentRequest::new(Requester::CustomerInitiated)
                .set_selection(SelectionType::CustomRequest)
                .set_customer("cust")
                .set_free_barber("barber")
        ),
        Just(
            AppointmentRequest::new(Requester::CustomerInitiated)
                .set_selection(SelectionType::CustomRequest)
                .set_customer("cust")
                .set_free_barber("barber")
                .set_store("store")
        ),
        Just(
            AppointmentRequest::new(Requester::StoreInitiated)
                .set_store("store")
                .set_free_barber("barber")
        ),
        Just(
            AppointmentRequest::new(Requester::StoreInitiated)
                .set_store("store")
                .set_customer("cust")
        ),
        Just(
            AppointmentRequest::new(Requester::CustomerInitiated)
                .set_selection(SelectionType::StoreSelection)
                .set_customer("cust")
                .set_free_barber("barber")
        ),
    ]
    .prop_map(|request| {
        request
            .build("appt_prop".into(), t0())
            .expect("strategy only yields valid layouts")
    })
}

fn apply(appt: &mut Appointment, command: &Command, now: &TimeStamp, policy: &ExpiryPolicy) -> bool {
    match command {
        Command::Decide(role, approve) => appt.decide(*role, *approve, now, policy).is_ok(),
        Command::Attach => appt.attach_store("store_late", now, policy).is_ok(),
        Command::Expire => matches!(appt.expire(now, policy), Expiry::Expired(_)),
        Command::Cancel(role) => appt.cancel(*role, now).is_ok(),
        Command::Complete(role) => appt.complete(*role, now).is_ok(),
    }
}

fn is_outcome(status: AppointmentStatus) -> bool {
    matches!(
        status,
        AppointmentStatus::Approved | AppointmentStatus::Rejected | AppointmentStatus::Unanswered
    )
}

proptest! {
    #[test]
    fn deadline_follows_variant_and_viewer(appt in appointment_strategy(), viewer in role_strategy()) {
        let policy = ExpiryPolicy::default();
        let expected = if appt.selection() == SelectionType::StoreSelection
            && viewer == Role::FreeBarber
            && !appt.store_attached()
        {
            Duration::minutes(30)
        } else {
            Duration::minutes(5)
        };

        prop_assert_eq!(policy.deadline(&appt, viewer), t0().plus(expected));
    }

    #[test]
    fn at_most_one_outcome_then_no_decisions(
        mut appt in appointment_strategy(),
        steps in prop::collection::vec((command_strategy(), 0i64..2400), 1..25),
    ) {
        let policy = ExpiryPolicy::default();
        let mut now = t0();
        let mut outcomes = vec![];

        for (command, gap_secs) in &steps {
            now = now.plus(Duration::seconds(*gap_secs));
            let before = appt.status();
            let accepted = apply(&mut appt, command, &now, &policy);
            let after = appt.status();

            if !accepted {
                prop_assert_eq!(before, after);
            }
            if before == AppointmentStatus::Pending && is_outcome(after) {
                outcomes.push(after);
            }
            if before != AppointmentStatus::Pending {
                // nothing reopens or swaps its outcome
                prop_assert!(after != AppointmentStatus::Pending);
                if let Command::Decide(..) = command {
                    prop_assert!(!accepted);
                }
            }
        }

        prop_assert!(outcomes.len() <= 1);
    }

    #[test]
    fn expiring_twice_equals_expiring_once(appt in appointment_strategy(), offset_secs in 0i64..3600) {
        let policy = ExpiryPolicy::default();
        let now = t0().plus(Duration::seconds(offset_secs));

        let mut once = appt.clone();
        once.expire(&now, &policy);
        let mut twice = once.clone();
        let second = twice.expire(&now, &policy);

        prop_assert_eq!(&once, &twice);
        prop_assert!(!matches!(second, Expiry::Expired(_)));
    }

    #[test]
    fn late_approval_is_expired_without_a_timer(appt in appointment_strategy(), late_secs in 0i64..600) {
        let policy = ExpiryPolicy::default();
        let Some(awaiting) = appt.awaiting() else {
            return Ok(());
        };
        // a barber accepts a store selection request by attaching a venue
        prop_assume!(appt.selection() != SelectionType::StoreSelection);

        let deadline = policy.deadline(&appt, awaiting);
        let now = deadline.plus(Duration::seconds(1 + late_secs));

        let mut late = appt.clone();
        let err = late.decide(awaiting, true, &now, &policy).unwrap_err();
        prop_assert!(
            matches!(err, NegotiationError::Expired { .. }),
            "expected Expired, got {:?}",
            err
        );
        prop_assert_eq!(late, appt);
    }
}

#[test]
fn store_selection_attach_at_deadline_is_expired() {
    let policy = ExpiryPolicy::default();
    let mut appt = AppointmentRequest::new(Requester::CustomerInitiated)
        .set_selection(SelectionType::StoreSelection)
        .set_customer("cust")
        .set_free_barber("barber")
        .build("appt_edge".into(), t0())
        .unwrap();

    let err = appt
        .attach_store("store", &t0().plus(Duration::minutes(30)), &policy)
        .unwrap_err();
    assert!(matches!(err, NegotiationError::Expired { role: Role::FreeBarber, .. }));
}
