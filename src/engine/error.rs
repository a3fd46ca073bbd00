use ulid::Ulid;

use crate::model::{Day, TimeSlot};

#[derive(Debug)]
pub enum EngineError {
    MissingParameter(&'static str),
    InvalidParameter(String),
    SlotAlreadyBooked {
        classroom_id: Ulid,
        day: Day,
        slot: TimeSlot,
        existing: Ulid,
    },
    NotFound(Ulid),
    AlreadyExists(String),
    /// Still referenced by timetable entries.
    InUse(Ulid),
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    StorageFailure(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::MissingParameter(name) => write!(f, "missing parameter: {name}"),
            EngineError::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            EngineError::SlotAlreadyBooked {
                classroom_id,
                day,
                slot,
                existing,
            } => write!(
                f,
                "classroom {classroom_id} is already booked on {day} at {slot} (entry {existing})"
            ),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::InUse(id) => {
                write!(f, "{id} is still referenced by timetable entries")
            }
            EngineError::Forbidden(msg) => write!(f, "access denied: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StorageFailure(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
