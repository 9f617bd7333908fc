use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Cancelled bookings drop out of capacity counts and duplicate checks;
    /// their rows (and serials) stay.
    pub fn is_active(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

/// One patient's claim on a session. Never deleted — status is the only
/// mutable field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub patient_id: Ulid,
    pub serial: u32,
    pub status: BookingStatus,
    pub accepted_at: Ms,
}

/// A doctor's bookable time block plus every booking ever taken on it.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub span: Span,
    /// Max concurrently active (non-cancelled) bookings.
    pub capacity: u32,
    /// Append-ordered: serials are issued in acceptance order.
    pub bookings: Vec<Booking>,
}

impl SessionState {
    pub fn new(id: Ulid, doctor_id: Ulid, span: Span, capacity: u32) -> Self {
        Self {
            id,
            doctor_id,
            span,
            capacity,
            bookings: Vec::new(),
        }
    }

    pub fn active_count(&self) -> u32 {
        self.bookings.iter().filter(|b| b.status.is_active()).count() as u32
    }

    /// The patient's non-cancelled booking, if any. Cancelled bookings do not
    /// block a re-book.
    pub fn active_booking_for(&self, patient_id: &Ulid) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.patient_id == *patient_id && b.status.is_active())
    }

    /// One past the highest serial ever issued, cancelled bookings included —
    /// a cancelled serial is never reissued, so cancellation leaves gaps.
    pub fn next_serial(&self) -> u32 {
        self.bookings.iter().map(|b| b.serial).max().unwrap_or(0) + 1
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub id: Ulid,
    pub name: String,
    pub age: Option<u32>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drug {
    pub id: Ulid,
    pub name: String,
    pub strength: Option<String>,
    pub form: Option<String>,
}

/// Batch-level clinical context, duplicated verbatim onto every line of the
/// visit it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClinicalFields {
    pub diagnosis: Option<String>,
    pub advice: Option<String>,
    pub chief_complaint: Option<String>,
    pub history: Option<String>,
    /// Raw JSON text — WAL records are bincode, which cannot round-trip an
    /// untyped `serde_json::Value`. The HTTP layer converts to/from objects.
    pub exam_findings: Option<String>,
    pub investigations: Option<String>,
    pub follow_up: Option<Ms>,
}

/// One drug line of a visit. All lines of a visit share `doctor_id`,
/// `recorded_at` and `clinical`; (patient, doctor, recorded_at) is the
/// visit's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrescriptionLine {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub recorded_at: Ms,
    pub drug_id: Ulid,
    pub quantity: String,
    pub instruction: String,
    pub duration: String,
    pub clinical: ClinicalFields,
}

/// A prescription line as submitted by a caller. Lines without a drug
/// reference are silently dropped at intake.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineDraft {
    pub drug_id: Option<Ulid>,
    pub quantity: Option<String>,
    pub instruction: Option<String>,
    pub duration: Option<String>,
}

/// Line payload inside visit events: everything per-line except the fields
/// the batch shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitLine {
    pub id: Ulid,
    pub drug_id: Ulid,
    pub quantity: String,
    pub instruction: String,
    pub duration: String,
}

/// Patient descriptor accepted by the batch writer: with an id it merges the
/// `Some` fields into the registry entry, without one it registers a new
/// patient.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatientUpsert {
    pub id: Option<Ulid>,
    pub name: Option<String>,
    pub age: Option<u32>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// All prescription lines ever written for one patient, sorted by
/// `recorded_at`.
#[derive(Debug, Clone)]
pub struct ChartState {
    pub patient_id: Ulid,
    pub lines: Vec<PrescriptionLine>,
}

impl ChartState {
    pub fn new(patient_id: Ulid) -> Self {
        Self {
            patient_id,
            lines: Vec::new(),
        }
    }

    /// Insert keeping sort order by recorded_at.
    pub fn insert_line(&mut self, line: PrescriptionLine) {
        let pos = self
            .lines
            .partition_point(|l| l.recorded_at <= line.recorded_at);
        self.lines.insert(pos, line);
    }

    pub fn has_batch(&self, doctor_id: &Ulid, at: Ms) -> bool {
        self.lines
            .iter()
            .any(|l| l.doctor_id == *doctor_id && l.recorded_at == at)
    }

    pub fn batch(&self, doctor_id: &Ulid, at: Ms) -> impl Iterator<Item = &PrescriptionLine> {
        self.lines
            .iter()
            .filter(move |l| l.doctor_id == *doctor_id && l.recorded_at == at)
    }

    /// Remove every line of the batch at `at`. Returns how many were removed.
    pub fn remove_batch(&mut self, doctor_id: &Ulid, at: Ms) -> usize {
        let before = self.lines.len();
        self.lines
            .retain(|l| !(l.doctor_id == *doctor_id && l.recorded_at == at));
        before - self.lines.len()
    }

    /// Distinct batch stamps for this doctor within ±`tolerance` of `at`,
    /// ascending.
    pub fn stamps_near(&self, doctor_id: &Ulid, at: Ms, tolerance: Ms) -> Vec<Ms> {
        let mut stamps: Vec<Ms> = self
            .lines
            .iter()
            .filter(|l| l.doctor_id == *doctor_id && (l.recorded_at - at).abs() <= tolerance)
            .map(|l| l.recorded_at)
            .collect();
        stamps.sort_unstable();
        stamps.dedup();
        stamps
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SessionCreated {
        id: Ulid,
        doctor_id: Ulid,
        span: Span,
        capacity: u32,
    },
    SessionUpdated {
        id: Ulid,
        span: Span,
        capacity: u32,
    },
    SessionDeleted {
        id: Ulid,
    },
    BookingAccepted {
        id: Ulid,
        session_id: Ulid,
        patient_id: Ulid,
        serial: u32,
        accepted_at: Ms,
    },
    BookingStatusChanged {
        id: Ulid,
        session_id: Ulid,
        status: BookingStatus,
    },
    PatientRegistered {
        patient: PatientRecord,
    },
    PatientUpdated {
        patient: PatientRecord,
    },
    DrugRegistered {
        drug: Drug,
    },
    DrugRemoved {
        id: Ulid,
    },
    /// One whole visit — patient upsert plus every kept line — in a single
    /// record, so a replayed WAL can never surface a partial visit.
    VisitRecorded {
        patient: PatientRecord,
        doctor_id: Ulid,
        recorded_at: Ms,
        clinical: ClinicalFields,
        lines: Vec<VisitLine>,
    },
    /// Wholesale replacement of the batch at `original_at` with a fresh
    /// stamp, again as one record.
    VisitReplaced {
        patient_id: Ulid,
        doctor_id: Ulid,
        original_at: Ms,
        recorded_at: Ms,
        clinical: ClinicalFields,
        lines: Vec<VisitLine>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub capacity: u32,
    /// Current non-cancelled booking count.
    pub booked: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingInfo {
    pub id: Ulid,
    pub session_id: Ulid,
    pub patient_id: Ulid,
    pub serial: u32,
    pub status: BookingStatus,
    pub accepted_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitLineInfo {
    pub id: Ulid,
    pub drug_id: Ulid,
    pub quantity: String,
    pub instruction: String,
    pub duration: String,
}

/// A full visit as returned for reprint: the shared fields once, then the
/// lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitBatchInfo {
    pub patient_id: Ulid,
    pub doctor_id: Ulid,
    pub recorded_at: Ms,
    pub clinical: ClinicalFields,
    pub lines: Vec<VisitLineInfo>,
}
