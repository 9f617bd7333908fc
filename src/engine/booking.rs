use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{now_ms, Engine, EngineError};

pub(super) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInput("session must end after it starts"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SESSION_DURATION_MS {
        return Err(EngineError::LimitExceeded("session span too wide"));
    }
    Ok(())
}

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::InvalidInput("session capacity must be positive"));
    }
    if capacity > MAX_SESSION_CAPACITY {
        return Err(EngineError::LimitExceeded("session capacity too large"));
    }
    Ok(())
}

impl Engine {
    /// Spans of the doctor's other sessions. Read locks are taken briefly
    /// one at a time, never while holding another session's write lock.
    async fn sibling_spans(&self, doctor_id: &Ulid, exclude: Option<Ulid>) -> Vec<(Ulid, Span)> {
        let ids = self
            .doctor_sessions
            .get(doctor_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut spans = Vec::with_capacity(ids.len());
        for sid in ids {
            if Some(sid) == exclude {
                continue;
            }
            if let Some(ss) = self.get_session(&sid) {
                let guard = ss.read().await;
                spans.push((sid, guard.span));
            }
        }
        spans
    }

    pub async fn create_session(
        &self,
        id: Ulid,
        doctor_id: Ulid,
        span: Span,
        capacity: u32,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        validate_capacity(capacity)?;
        if self.sessions.len() >= MAX_SESSIONS_PER_CLINIC {
            return Err(EngineError::LimitExceeded("too many sessions"));
        }
        if self.sessions.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        for (sid, other) in self.sibling_spans(&doctor_id, None).await {
            if span.overlaps(&other) {
                return Err(EngineError::OverlappingSession(sid));
            }
        }

        let event = Event::SessionCreated {
            id,
            doctor_id,
            span,
            capacity,
        };
        self.wal_append(&event).await?;
        let ss = SessionState::new(id, doctor_id, span, capacity);
        self.sessions.insert(id, Arc::new(RwLock::new(ss)));
        self.doctor_sessions.entry(doctor_id).or_default().push(id);
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_session(
        &self,
        id: Ulid,
        span: Span,
        capacity: u32,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        validate_capacity(capacity)?;
        let ss = self
            .get_session(&id)
            .ok_or(EngineError::SessionNotFound(id))?;
        // Snapshot the doctor id without holding the write lock yet.
        let doctor_id = ss.read().await.doctor_id;
        let siblings = self.sibling_spans(&doctor_id, Some(id)).await;
        for (sid, other) in siblings {
            if span.overlaps(&other) {
                return Err(EngineError::OverlappingSession(sid));
            }
        }

        let mut guard = ss.write().await;
        let active = guard.active_count();
        if capacity < active {
            return Err(EngineError::CapacityBelowActive { capacity, active });
        }
        let event = Event::SessionUpdated { id, span, capacity };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// A session goes away only once no active booking remains on it.
    pub async fn delete_session(&self, id: Ulid) -> Result<(), EngineError> {
        let ss = self
            .get_session(&id)
            .ok_or(EngineError::SessionNotFound(id))?;
        let guard = ss.write().await;
        if guard.active_count() > 0 {
            return Err(EngineError::HasActiveBookings(id));
        }

        let event = Event::SessionDeleted { id };
        self.wal_append(&event).await?;
        for b in &guard.bookings {
            self.booking_index.remove(&b.id);
        }
        if let Some(mut owned) = self.doctor_sessions.get_mut(&guard.doctor_id) {
            owned.retain(|s| s != &id);
        }
        drop(guard);
        self.sessions.remove(&id);
        self.notify.send(id, &event);
        Ok(())
    }

    /// Assign the next serial for `session_id` to `patient_id`.
    ///
    /// The session write lock is held from the duplicate check through the
    /// WAL append, so concurrent bookers of the same session are serialized
    /// across check-count-insert and can never observe the same count.
    /// Bookers of different sessions proceed fully in parallel.
    pub async fn book_serial(
        &self,
        id: Ulid,
        session_id: Ulid,
        patient_id: Ulid,
    ) -> Result<u32, EngineError> {
        let ss = self
            .get_session(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))?;
        let mut guard = ss.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SESSION {
            return Err(EngineError::LimitExceeded("too many bookings on session"));
        }

        if guard.active_booking_for(&patient_id).is_some() {
            return Err(EngineError::DuplicateBooking {
                session_id,
                patient_id,
            });
        }
        if guard.active_count() >= guard.capacity {
            return Err(EngineError::SessionFull(guard.capacity));
        }
        let serial = guard.next_serial();

        let event = Event::BookingAccepted {
            id,
            session_id,
            patient_id,
            serial,
            accepted_at: now_ms(),
        };
        self.persist_and_apply(session_id, &mut guard, &event).await?;
        Ok(serial)
    }

    /// Staff action: Confirmed → Completed or Confirmed → Cancelled.
    /// Cancelling frees a capacity slot but never frees the serial.
    pub async fn set_booking_status(
        &self,
        booking_id: Ulid,
        status: BookingStatus,
    ) -> Result<Ulid, EngineError> {
        let (session_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let booking = guard
            .booking_mut(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let from = booking.status;
        let allowed = from == BookingStatus::Confirmed
            && matches!(status, BookingStatus::Completed | BookingStatus::Cancelled);
        if !allowed {
            return Err(EngineError::InvalidStatusChange { from, to: status });
        }

        let event = Event::BookingStatusChanged {
            id: booking_id,
            session_id,
            status,
        };
        self.persist_and_apply(session_id, &mut guard, &event).await?;
        Ok(session_id)
    }
}
