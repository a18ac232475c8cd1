//! Identifier generation for appointments and notifications

use bech32::Bech32m;
use uuid7::uuid7;

pub const APPOINTMENT_HRP: &str = "appt_";

// construct a unique id then encode using bech32 under the given prefix
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

pub fn new_appointment_id() -> anyhow::Result<String> {
    new_uuid_to_bech32(APPOINTMENT_HRP)
}

/// Notification ids are derived from what the notification *is*, not when it
/// was written, so emitting the same transition twice lands on the same key.
pub fn notification_id(
    appointment_id: &str,
    sequence: u64,
    notification_type: &str,
    recipient_role: &str,
) -> anyhow::Result<String> {
    let cbor = minicbor::to_vec((appointment_id, sequence, notification_type, recipient_role))?;
    Ok(sha256::digest(&cbor))
}
