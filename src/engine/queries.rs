use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedSessionState};

fn session_info(ss: &SessionState) -> SessionInfo {
    SessionInfo {
        id: ss.id,
        doctor_id: ss.doctor_id,
        start: ss.span.start,
        end: ss.span.end,
        capacity: ss.capacity,
        booked: ss.active_count(),
    }
}

impl Engine {
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let arcs: Vec<SharedSessionState> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for ss in arcs {
            let guard = ss.read().await;
            out.push(session_info(&guard));
        }
        out.sort_by_key(|s| s.start);
        out
    }

    pub async fn sessions_for_doctor(&self, doctor_id: Ulid) -> Vec<SessionInfo> {
        let ids = self
            .doctor_sessions
            .get(&doctor_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for sid in ids {
            if let Some(ss) = self.get_session(&sid) {
                let guard = ss.read().await;
                out.push(session_info(&guard));
            }
        }
        out.sort_by_key(|s| s.start);
        out
    }

    /// All bookings ever taken on the session, in acceptance (serial) order.
    pub async fn get_bookings(&self, session_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let ss = self
            .get_session(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))?;
        let guard = ss.read().await;
        Ok(guard
            .bookings
            .iter()
            .map(|b| BookingInfo {
                id: b.id,
                session_id,
                patient_id: b.patient_id,
                serial: b.serial,
                status: b.status,
                accepted_at: b.accepted_at,
            })
            .collect())
    }

    pub fn get_patient(&self, id: &Ulid) -> Option<PatientRecord> {
        self.patients.get(id).map(|e| e.value().clone())
    }

    pub fn list_patients(&self) -> Vec<PatientRecord> {
        let mut out: Vec<PatientRecord> =
            self.patients.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|p| p.id);
        out
    }

    pub fn list_drugs(&self) -> Vec<Drug> {
        let mut out: Vec<Drug> = self.drugs.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|d| d.id);
        out
    }

    /// Every visit batch on the patient's chart, newest first. Handy for the
    /// portal's prescription history view.
    pub async fn visit_history(
        &self,
        patient_id: Ulid,
        doctor_id: Option<Ulid>,
    ) -> Vec<VisitBatchInfo> {
        let Some(chart) = self.charts.get(&patient_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let guard = chart.read().await;

        let mut batches: Vec<VisitBatchInfo> = Vec::new();
        for l in &guard.lines {
            if doctor_id.is_some_and(|d| d != l.doctor_id) {
                continue;
            }
            let line = VisitLineInfo {
                id: l.id,
                drug_id: l.drug_id,
                quantity: l.quantity.clone(),
                instruction: l.instruction.clone(),
                duration: l.duration.clone(),
            };
            let pos = batches
                .iter()
                .position(|b| b.doctor_id == l.doctor_id && b.recorded_at == l.recorded_at);
            match pos {
                Some(i) => batches[i].lines.push(line),
                None => batches.push(VisitBatchInfo {
                    patient_id,
                    doctor_id: l.doctor_id,
                    recorded_at: l.recorded_at,
                    clinical: l.clinical.clone(),
                    lines: vec![line],
                }),
            }
        }
        batches.sort_by_key(|b| std::cmp::Reverse(b.recorded_at));
        batches
    }
}
