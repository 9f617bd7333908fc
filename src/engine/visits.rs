use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{now_ms, Engine, EngineError};

/// Client-submitted reprint timestamps drift from the stored stamp (sub-second
/// truncation, timezone normalization), so lookup matches within this window.
pub const VISIT_MATCH_TOLERANCE_MS: Ms = 2_000;

fn validate_text(value: &Option<String>, what: &'static str) -> Result<(), EngineError> {
    if let Some(s) = value
        && s.len() > MAX_TEXT_FIELD_LEN
    {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn validate_clinical(clinical: &ClinicalFields) -> Result<(), EngineError> {
    validate_text(&clinical.diagnosis, "diagnosis too long")?;
    validate_text(&clinical.advice, "advice too long")?;
    validate_text(&clinical.chief_complaint, "chief complaint too long")?;
    validate_text(&clinical.history, "history too long")?;
    validate_text(&clinical.exam_findings, "exam findings too long")?;
    validate_text(&clinical.investigations, "investigations too long")?;
    Ok(())
}

/// Lines without a drug reference are dropped, silently — longstanding
/// intake policy, not an error.
fn keep_lines(lines: Vec<LineDraft>) -> Vec<VisitLine> {
    lines
        .into_iter()
        .filter_map(|l| {
            l.drug_id.map(|drug_id| VisitLine {
                id: Ulid::new(),
                drug_id,
                quantity: l.quantity.unwrap_or_default(),
                instruction: l.instruction.unwrap_or_default(),
                duration: l.duration.unwrap_or_default(),
            })
        })
        .collect()
}

impl Engine {
    // ── Patient registry ─────────────────────────────────────

    pub async fn register_patient(&self, patient: PatientRecord) -> Result<(), EngineError> {
        if patient.name.is_empty() {
            return Err(EngineError::InvalidInput("patient name required"));
        }
        if patient.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("patient name too long"));
        }
        if self.patients.len() >= MAX_PATIENTS_PER_CLINIC {
            return Err(EngineError::LimitExceeded("too many patients"));
        }
        if self.patients.contains_key(&patient.id) {
            return Err(EngineError::AlreadyExists(patient.id));
        }

        let event = Event::PatientRegistered {
            patient: patient.clone(),
        };
        self.wal_append(&event).await?;
        self.patients.insert(patient.id, patient);
        Ok(())
    }

    pub async fn update_patient(&self, patient: PatientRecord) -> Result<(), EngineError> {
        if patient.name.is_empty() {
            return Err(EngineError::InvalidInput("patient name required"));
        }
        if patient.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("patient name too long"));
        }
        if !self.patients.contains_key(&patient.id) {
            return Err(EngineError::PatientNotFound(patient.id));
        }

        let event = Event::PatientUpdated {
            patient: patient.clone(),
        };
        self.wal_append(&event).await?;
        self.patients.insert(patient.id, patient);
        Ok(())
    }

    // ── Drug catalog ─────────────────────────────────────────

    pub async fn register_drug(&self, drug: Drug) -> Result<(), EngineError> {
        if drug.name.is_empty() {
            return Err(EngineError::InvalidInput("drug name required"));
        }
        if drug.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("drug name too long"));
        }
        if self.drugs.len() >= MAX_DRUGS_PER_CLINIC {
            return Err(EngineError::LimitExceeded("too many drugs"));
        }
        if self.drugs.contains_key(&drug.id) {
            return Err(EngineError::AlreadyExists(drug.id));
        }

        let event = Event::DrugRegistered { drug: drug.clone() };
        self.wal_append(&event).await?;
        self.drugs.insert(drug.id, drug);
        Ok(())
    }

    pub async fn remove_drug(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.drugs.contains_key(&id) {
            return Err(EngineError::DrugNotFound(id));
        }
        let event = Event::DrugRemoved { id };
        self.wal_append(&event).await?;
        self.drugs.remove(&id);
        Ok(())
    }

    // ── Visit batches ────────────────────────────────────────

    /// Merge the upsert into the registry's view of the patient, or mint a
    /// new record when no identity was supplied.
    fn resolve_patient(&self, upsert: PatientUpsert) -> Result<PatientRecord, EngineError> {
        match upsert.id {
            Some(id) => {
                let existing = self
                    .patients
                    .get(&id)
                    .map(|p| p.value().clone())
                    .ok_or(EngineError::PatientNotFound(id))?;
                Ok(PatientRecord {
                    id,
                    name: upsert.name.unwrap_or(existing.name),
                    age: upsert.age.or(existing.age),
                    phone: upsert.phone.or(existing.phone),
                    address: upsert.address.or(existing.address),
                })
            }
            None => {
                let name = upsert
                    .name
                    .filter(|n| !n.is_empty())
                    .ok_or(EngineError::InvalidInput("patient name required"))?;
                Ok(PatientRecord {
                    id: Ulid::new(),
                    name,
                    age: upsert.age,
                    phone: upsert.phone,
                    address: upsert.address,
                })
            }
        }
    }

    /// Persist one clinical visit as an atomic unit.
    ///
    /// One timestamp is captured for the whole batch before any line is
    /// materialized — it is the visit's identity and the handle callers keep
    /// for edits and reprints. The patient upsert travels inside the same
    /// WAL record as the lines, so a crash can never leave half a visit.
    pub async fn record_visit(
        &self,
        doctor_id: Ulid,
        patient: PatientUpsert,
        lines: Vec<LineDraft>,
        clinical: ClinicalFields,
    ) -> Result<(Ulid, Ms), EngineError> {
        if lines.len() > MAX_LINES_PER_VISIT {
            return Err(EngineError::LimitExceeded("too many lines in visit"));
        }
        validate_clinical(&clinical)?;
        if patient.name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("patient name too long"));
        }
        let record = self.resolve_patient(patient)?;
        let patient_id = record.id;

        let chart = self.chart_handle(patient_id);
        let mut guard = chart.write().await;

        // (patient, doctor, stamp) is the visit identity; bump until unique
        // so two saves in the same millisecond never merge.
        let mut recorded_at = now_ms();
        while guard.has_batch(&doctor_id, recorded_at) {
            recorded_at += 1;
        }

        let event = Event::VisitRecorded {
            patient: record,
            doctor_id,
            recorded_at,
            clinical,
            lines: keep_lines(lines),
        };
        self.persist_and_apply_chart(patient_id, &mut guard, &event)
            .await?;
        Ok((patient_id, recorded_at))
    }

    /// Replace the batch at `original_at` wholesale under a fresh stamp.
    /// Old and new rows are never simultaneously visible, and a WAL failure
    /// leaves the original batch untouched.
    pub async fn replace_visit(
        &self,
        doctor_id: Ulid,
        patient_id: Ulid,
        original_at: Ms,
        lines: Vec<LineDraft>,
        clinical: ClinicalFields,
    ) -> Result<Ms, EngineError> {
        if lines.len() > MAX_LINES_PER_VISIT {
            return Err(EngineError::LimitExceeded("too many lines in visit"));
        }
        validate_clinical(&clinical)?;
        if !self.patients.contains_key(&patient_id) {
            return Err(EngineError::PatientNotFound(patient_id));
        }

        let chart = self.chart_handle(patient_id);
        let mut guard = chart.write().await;
        if !guard.has_batch(&doctor_id, original_at) {
            return Err(EngineError::VisitNotFound {
                patient_id,
                doctor_id,
                at: original_at,
            });
        }

        let mut recorded_at = now_ms();
        while guard.has_batch(&doctor_id, recorded_at) {
            recorded_at += 1;
        }

        let event = Event::VisitReplaced {
            patient_id,
            doctor_id,
            original_at,
            recorded_at,
            clinical,
            lines: keep_lines(lines),
        };
        self.persist_and_apply_chart(patient_id, &mut guard, &event)
            .await?;
        Ok(recorded_at)
    }

    /// Reprint lookup. When the tolerance window holds several distinct
    /// batches, the most recent one wins.
    pub async fn find_visit(
        &self,
        patient_id: Ulid,
        doctor_id: Ulid,
        approx_at: Ms,
    ) -> Result<VisitBatchInfo, EngineError> {
        let not_found = EngineError::VisitNotFound {
            patient_id,
            doctor_id,
            at: approx_at,
        };
        let chart = self
            .charts
            .get(&patient_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::VisitNotFound {
                patient_id,
                doctor_id,
                at: approx_at,
            })?;
        let guard = chart.read().await;

        let stamps = guard.stamps_near(&doctor_id, approx_at, VISIT_MATCH_TOLERANCE_MS);
        let recorded_at = *stamps.last().ok_or(not_found)?;

        let lines: Vec<&PrescriptionLine> = guard.batch(&doctor_id, recorded_at).collect();
        let clinical = lines
            .first()
            .map(|l| l.clinical.clone())
            .unwrap_or_default();
        Ok(VisitBatchInfo {
            patient_id,
            doctor_id,
            recorded_at,
            clinical,
            lines: lines
                .into_iter()
                .map(|l| VisitLineInfo {
                    id: l.id,
                    drug_id: l.drug_id,
                    quantity: l.quantity.clone(),
                    instruction: l.instruction.clone(),
                    duration: l.duration.clone(),
                })
                .collect(),
        })
    }
}
