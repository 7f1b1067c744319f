use chrono::TimeDelta;
use ulid::Ulid;

use crate::model::Ts;

/// Malformed generator fields. Always raised before anything is mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingRule,
    InvalidRule(String),
    StartAfterEnd { start: Ts, end: Ts },
    RepeatUntilBeforeEnd { repeat_until: Ts, end: Ts },
    DailySpansMultipleDays { duration: TimeDelta },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingRule => write!(f, "a rule must be supplied"),
            ValidationError::InvalidRule(e) => write!(f, "invalid rule: {e}"),
            ValidationError::StartAfterEnd { start, end } => {
                write!(f, "start {start} must not be later than end {end}")
            }
            ValidationError::RepeatUntilBeforeEnd { repeat_until, end } => {
                write!(f, "repeat_until {repeat_until} must not be earlier than end {end}")
            }
            ValidationError::DailySpansMultipleDays { duration } => write!(
                f,
                "daily events cannot span multiple days (duration {}h)",
                duration.num_hours()
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The entity exists but belongs to a different event.
    EventMismatch { id: Ulid, event_id: Ulid },
    Validation(ValidationError),
    /// Another transaction committed on this event first. Retryable.
    Conflict(Ulid),
    HasOccurrences(Ulid),
    LimitExceeded(&'static str),
    Storage(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::EventMismatch { id, event_id } => {
                write!(f, "{id} does not belong to event {event_id}")
            }
            EngineError::Validation(e) => write!(f, "validation failed: {e}"),
            EngineError::Conflict(id) => {
                write!(f, "concurrent modification of event {id}; retries exhausted")
            }
            EngineError::HasOccurrences(id) => {
                write!(f, "cannot delete event {id}: it still has occurrences")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}
