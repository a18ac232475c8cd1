use crate::appointment::{DecisionStatus, Role};
use crate::clock::TimeStamp;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("{0} is not a party to this appointment")]
    NotParticipant(Role),
    #[error("{role} decision window closed at {deadline}")]
    Expired { role: Role, deadline: TimeStamp },
    #[error("{role} has already decided: {decision}")]
    AlreadyDecided { role: Role, decision: DecisionStatus },
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Appointment {0} not found")]
    NotFound(String),
    #[error("Invalid appointment request: {0}")]
    InvalidRequest(String),
}

/// Flat error classification carried on command responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    NotParticipant,
    Expired,
    AlreadyDecided,
    InvalidTransition,
    NotFound,
    InvalidRequest,
    Internal,
}

impl NegotiationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NegotiationError::NotParticipant(_) => ErrorKind::NotParticipant,
            NegotiationError::Expired { .. } => ErrorKind::Expired,
            NegotiationError::AlreadyDecided { .. } => ErrorKind::AlreadyDecided,
            NegotiationError::InvalidTransition(_) => ErrorKind::InvalidTransition,
            NegotiationError::NotFound(_) => ErrorKind::NotFound,
            NegotiationError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<NegotiationError>(),
        Some(NegotiationError::NotFound(_))
    )
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Payload is not a JSON object")]
    NotAnObject,
    #[error("Payload is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("Field '{field}' has unrecognised value {value}")]
    UnknownValue { field: &'static str, value: String },
    #[error("Field '{field}' is not a valid timestamp: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
}
