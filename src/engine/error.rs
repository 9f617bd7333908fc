use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

#[derive(Debug)]
pub enum EngineError {
    SessionNotFound(Ulid),
    /// The patient already holds a non-cancelled booking on this session.
    DuplicateBooking { session_id: Ulid, patient_id: Ulid },
    /// Active bookings have reached the session capacity.
    SessionFull(u32),
    BookingNotFound(Ulid),
    InvalidStatusChange {
        from: BookingStatus,
        to: BookingStatus,
    },
    /// Sessions are deleted only once every booking is cancelled.
    HasActiveBookings(Ulid),
    /// The doctor already has a session covering part of this time range.
    OverlappingSession(Ulid),
    CapacityBelowActive { capacity: u32, active: u32 },
    PatientNotFound(Ulid),
    DrugNotFound(Ulid),
    VisitNotFound {
        patient_id: Ulid,
        doctor_id: Ulid,
        at: Ms,
    },
    AlreadyExists(Ulid),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SessionNotFound(id) => write!(f, "schedule session not found: {id}"),
            EngineError::DuplicateBooking {
                session_id,
                patient_id,
            } => write!(
                f,
                "patient {patient_id} already holds a serial for session {session_id}"
            ),
            EngineError::SessionFull(cap) => {
                write!(f, "session full: all {cap} serials taken")
            }
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::InvalidStatusChange { from, to } => {
                write!(f, "booking status cannot change from {from:?} to {to:?}")
            }
            EngineError::HasActiveBookings(id) => {
                write!(f, "cannot delete session {id}: active bookings exist")
            }
            EngineError::OverlappingSession(id) => {
                write!(f, "overlaps the doctor's existing session {id}")
            }
            EngineError::CapacityBelowActive { capacity, active } => write!(
                f,
                "capacity {capacity} is below the {active} active bookings"
            ),
            EngineError::PatientNotFound(id) => write!(f, "patient not found: {id}"),
            EngineError::DrugNotFound(id) => write!(f, "drug not found: {id}"),
            EngineError::VisitNotFound {
                patient_id,
                doctor_id,
                at,
            } => write!(
                f,
                "no visit for patient {patient_id} by doctor {doctor_id} near {at}"
            ),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
