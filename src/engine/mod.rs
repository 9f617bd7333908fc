mod booking;
mod error;
mod queries;
mod visits;

pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSessionState = Arc<RwLock<SessionState>>;
pub type SharedChartState = Arc<RwLock<ChartState>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One clinic's state: schedule sessions, patient charts and the registries,
/// all folded from the clinic's WAL.
pub struct Engine {
    pub(super) sessions: DashMap<Ulid, SharedSessionState>,
    pub(super) charts: DashMap<Ulid, SharedChartState>,
    pub(super) patients: DashMap<Ulid, PatientRecord>,
    pub(super) drugs: DashMap<Ulid, Drug>,
    /// Reverse lookup: booking id → session id
    pub(super) booking_index: DashMap<Ulid, Ulid>,
    /// Doctor → session ids, for overlap checks and per-doctor listings.
    pub(super) doctor_sessions: DashMap<Ulid, Vec<Ulid>>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a session-scoped event (no locking — caller holds the lock).
fn apply_to_session(ss: &mut SessionState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingAccepted {
            id,
            session_id,
            patient_id,
            serial,
            accepted_at,
        } => {
            ss.bookings.push(Booking {
                id: *id,
                patient_id: *patient_id,
                serial: *serial,
                status: BookingStatus::Confirmed,
                accepted_at: *accepted_at,
            });
            booking_index.insert(*id, *session_id);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = ss.booking_mut(id) {
                b.status = *status;
            }
        }
        Event::SessionUpdated { span, capacity, .. } => {
            ss.span = *span;
            ss.capacity = *capacity;
        }
        // Created/Deleted are handled at the DashMap level, not here
        _ => {}
    }
}

/// Apply a chart-scoped event (no locking — caller holds the lock). The
/// patient upsert embedded in visit events lands in the registry here, so a
/// visit and its patient write are one atomic application.
fn apply_to_chart(cs: &mut ChartState, event: &Event, patients: &DashMap<Ulid, PatientRecord>) {
    match event {
        Event::VisitRecorded {
            patient,
            doctor_id,
            recorded_at,
            clinical,
            lines,
        } => {
            patients.insert(patient.id, patient.clone());
            for l in lines {
                cs.insert_line(PrescriptionLine {
                    id: l.id,
                    doctor_id: *doctor_id,
                    recorded_at: *recorded_at,
                    drug_id: l.drug_id,
                    quantity: l.quantity.clone(),
                    instruction: l.instruction.clone(),
                    duration: l.duration.clone(),
                    clinical: clinical.clone(),
                });
            }
        }
        Event::VisitReplaced {
            doctor_id,
            original_at,
            recorded_at,
            clinical,
            lines,
            ..
        } => {
            cs.remove_batch(doctor_id, *original_at);
            for l in lines {
                cs.insert_line(PrescriptionLine {
                    id: l.id,
                    doctor_id: *doctor_id,
                    recorded_at: *recorded_at,
                    drug_id: l.drug_id,
                    quantity: l.quantity.clone(),
                    instruction: l.instruction.clone(),
                    duration: l.duration.clone(),
                    clinical: clinical.clone(),
                });
            }
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            sessions: DashMap::new(),
            charts: DashMap::new(),
            patients: DashMap::new(),
            drugs: DashMap::new(),
            booking_index: DashMap::new(),
            doctor_sessions: DashMap::new(),
            wal_tx,
            notify,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (lazy clinic
        // creation).
        for event in &events {
            match event {
                Event::SessionCreated {
                    id,
                    doctor_id,
                    span,
                    capacity,
                } => {
                    let ss = SessionState::new(*id, *doctor_id, *span, *capacity);
                    engine.sessions.insert(*id, Arc::new(RwLock::new(ss)));
                    engine.doctor_sessions.entry(*doctor_id).or_default().push(*id);
                }
                Event::SessionDeleted { id } => {
                    if let Some((_, ss)) = engine.sessions.remove(id) {
                        let guard = ss.try_read().expect("replay: uncontended read");
                        if let Some(mut owned) = engine.doctor_sessions.get_mut(&guard.doctor_id) {
                            owned.retain(|s| s != id);
                        }
                        for b in &guard.bookings {
                            engine.booking_index.remove(&b.id);
                        }
                    }
                }
                Event::SessionUpdated { id, .. }
                | Event::BookingAccepted { session_id: id, .. }
                | Event::BookingStatusChanged { session_id: id, .. } => {
                    if let Some(entry) = engine.sessions.get(id) {
                        let ss = entry.value().clone();
                        let mut guard = ss.try_write().expect("replay: uncontended write");
                        apply_to_session(&mut guard, event, &engine.booking_index);
                    }
                }
                Event::PatientRegistered { patient } | Event::PatientUpdated { patient } => {
                    engine.patients.insert(patient.id, patient.clone());
                }
                Event::DrugRegistered { drug } => {
                    engine.drugs.insert(drug.id, drug.clone());
                }
                Event::DrugRemoved { id } => {
                    engine.drugs.remove(id);
                }
                Event::VisitRecorded {
                    patient: PatientRecord { id, .. },
                    ..
                }
                | Event::VisitReplaced { patient_id: id, .. } => {
                    let cs = engine.chart_handle(*id);
                    let mut guard = cs.try_write().expect("replay: uncontended write");
                    apply_to_chart(&mut guard, event, &engine.patients);
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_session(&self, id: &Ulid) -> Option<SharedSessionState> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn get_session_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    /// The patient's chart, created on first use.
    pub(super) fn chart_handle(&self, patient_id: Ulid) -> SharedChartState {
        self.charts
            .entry(patient_id)
            .or_insert_with(|| Arc::new(RwLock::new(ChartState::new(patient_id))))
            .value()
            .clone()
    }

    /// WAL-append + apply + notify in one call, with the session lock held —
    /// the whole critical section either commits or leaves state untouched.
    pub(super) async fn persist_and_apply(
        &self,
        session_id: Ulid,
        ss: &mut SessionState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_session(ss, event, &self.booking_index);
        self.notify.send(session_id, event);
        Ok(())
    }

    /// Chart-side twin of `persist_and_apply`.
    pub(super) async fn persist_and_apply_chart(
        &self,
        patient_id: Ulid,
        cs: &mut ChartState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_chart(cs, event, &self.patients);
        self.notify.send(patient_id, event);
        Ok(())
    }

    /// Lookup booking → session, get session, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<SessionState>), EngineError> {
        let session_id = self
            .get_session_for_booking(booking_id)
            .ok_or(EngineError::BookingNotFound(*booking_id))?;
        let ss = self
            .get_session(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))?;
        let guard = ss.write_owned().await;
        Ok((session_id, guard))
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Cancelled bookings are preserved — their
    /// serials must stay burned after a restart.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.patients.iter() {
            events.push(Event::PatientRegistered {
                patient: entry.value().clone(),
            });
        }
        for entry in self.drugs.iter() {
            events.push(Event::DrugRegistered {
                drug: entry.value().clone(),
            });
        }

        let session_arcs: Vec<SharedSessionState> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for ss in session_arcs {
            let guard = ss.read().await;
            events.push(Event::SessionCreated {
                id: guard.id,
                doctor_id: guard.doctor_id,
                span: guard.span,
                capacity: guard.capacity,
            });
            for b in &guard.bookings {
                events.push(Event::BookingAccepted {
                    id: b.id,
                    session_id: guard.id,
                    patient_id: b.patient_id,
                    serial: b.serial,
                    accepted_at: b.accepted_at,
                });
                if b.status != BookingStatus::Confirmed {
                    events.push(Event::BookingStatusChanged {
                        id: b.id,
                        session_id: guard.id,
                        status: b.status,
                    });
                }
            }
        }

        let chart_arcs: Vec<SharedChartState> =
            self.charts.iter().map(|e| e.value().clone()).collect();
        for cs in chart_arcs {
            let guard = cs.read().await;
            let mut batches: HashMap<(Ulid, Ms), (ClinicalFields, Vec<VisitLine>)> = HashMap::new();
            for l in &guard.lines {
                let entry = batches
                    .entry((l.doctor_id, l.recorded_at))
                    .or_insert_with(|| (l.clinical.clone(), Vec::new()));
                entry.1.push(VisitLine {
                    id: l.id,
                    drug_id: l.drug_id,
                    quantity: l.quantity.clone(),
                    instruction: l.instruction.clone(),
                    duration: l.duration.clone(),
                });
            }
            let patient = self
                .patients
                .get(&guard.patient_id)
                .map(|p| p.value().clone())
                .unwrap_or(PatientRecord {
                    id: guard.patient_id,
                    name: String::new(),
                    age: None,
                    phone: None,
                    address: None,
                });
            let mut keys: Vec<(Ulid, Ms)> = batches.keys().copied().collect();
            keys.sort_by_key(|(_, at)| *at);
            for key in keys {
                let (clinical, lines) = batches.remove(&key).unwrap();
                events.push(Event::VisitRecorded {
                    patient: patient.clone(),
                    doctor_id: key.0,
                    recorded_at: key.1,
                    clinical,
                    lines,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
