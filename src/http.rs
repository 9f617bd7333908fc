use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::error;
use ulid::Ulid;

use crate::auth::{self, AuthError, Caller, Role};
use crate::clinic::ClinicRegistry;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;

#[derive(Clone)]
pub struct AppState {
    pub clinics: Arc<ClinicRegistry>,
    pub api_token: Arc<str>,
}

impl AppState {
    pub fn new(clinics: Arc<ClinicRegistry>, api_token: impl Into<Arc<str>>) -> Self {
        Self {
            clinics,
            api_token: api_token.into(),
        }
    }
}

// ── Error mapping ────────────────────────────────────────────────

/// Every failure leaves as `{ "message": ... }` with a client- or
/// server-fault status. Infrastructure causes are logged here and never
/// leaked to the caller.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn forbidden() -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: "Forbidden".into(),
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal server error".into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::SessionNotFound(_) => Self::bad_request("Schedule not found"),
            EngineError::DuplicateBooking { .. } => {
                Self::bad_request("You have already booked a serial for this session.")
            }
            EngineError::SessionFull(_) => Self::bad_request("Sorry, this session is full."),
            EngineError::WalError(cause) => {
                error!("storage fault: {cause}");
                Self::internal()
            }
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
        match e {
            AuthError::MissingToken | AuthError::BadToken => Self {
                status: StatusCode::UNAUTHORIZED,
                message: "Unauthorized".into(),
            },
            AuthError::MissingIdentity | AuthError::BadIdentity => {
                Self::bad_request("Missing or malformed caller identity")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

/// Resolve the clinic engine and the authenticated caller for a request.
fn engine_for(state: &AppState, headers: &HeaderMap) -> Result<(Arc<Engine>, Caller), ApiError> {
    let caller = auth::authenticate(headers, &state.api_token)?;
    let clinic = headers
        .get("x-medlipi-clinic")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("default");
    let engine = state.clinics.get_or_create(clinic).map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidInput {
            ApiError::bad_request(e.to_string())
        } else {
            error!("failed to open clinic {clinic}: {e}");
            ApiError::internal()
        }
    })?;
    Ok((engine, caller))
}

fn require_staff(caller: &Caller) -> Result<(), ApiError> {
    match caller.role {
        Role::Doctor | Role::Staff => Ok(()),
        Role::Patient => Err(ApiError::forbidden()),
    }
}

fn require_doctor(caller: &Caller) -> Result<(), ApiError> {
    match caller.role {
        Role::Doctor => Ok(()),
        _ => Err(ApiError::forbidden()),
    }
}

/// Bodies are parsed by hand so malformed JSON fails with the same
/// `{ "message": ... }` envelope as every other client fault.
fn parse_body<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(bytes)
        .map_err(|e| ApiError::bad_request(format!("Invalid request body: {e}")))
}

// ── Request payloads ─────────────────────────────────────────────

#[derive(Deserialize)]
struct BookSerialRequest {
    schedule_id: Ulid,
    patient_id: Option<Ulid>,
}

#[derive(Deserialize)]
struct BookingStatusRequest {
    status: BookingStatus,
}

#[derive(Deserialize)]
struct ScheduleRequest {
    doctor_id: Option<Ulid>,
    start: Ms,
    end: Ms,
    capacity: u32,
}

#[derive(Deserialize)]
struct ScheduleUpdateRequest {
    start: Ms,
    end: Ms,
    capacity: u32,
}

#[derive(Deserialize)]
struct ScheduleListQuery {
    doctor_id: Option<Ulid>,
}

/// Clinical fields as the wire carries them: exam findings arrive as a JSON
/// object and are stored as canonical text.
#[derive(Default, Deserialize)]
struct ClinicalPayload {
    diagnosis: Option<String>,
    advice: Option<String>,
    chief_complaint: Option<String>,
    history: Option<String>,
    exam_findings: Option<serde_json::Value>,
    investigations: Option<String>,
    follow_up: Option<Ms>,
}

impl ClinicalPayload {
    fn into_fields(self) -> ClinicalFields {
        ClinicalFields {
            diagnosis: self.diagnosis,
            advice: self.advice,
            chief_complaint: self.chief_complaint,
            history: self.history,
            exam_findings: self.exam_findings.map(|v| v.to_string()),
            investigations: self.investigations,
            follow_up: self.follow_up,
        }
    }
}

#[derive(Deserialize)]
struct PrescriptionRequest {
    #[serde(default)]
    patient: PatientUpsert,
    #[serde(default)]
    lines: Vec<LineDraft>,
    #[serde(default)]
    clinical: ClinicalPayload,
}

#[derive(Deserialize)]
struct PrescriptionReplaceRequest {
    patient_id: Ulid,
    original_at: Ms,
    #[serde(default)]
    lines: Vec<LineDraft>,
    #[serde(default)]
    clinical: ClinicalPayload,
}

#[derive(Deserialize)]
struct ReprintQuery {
    patient_id: Option<Ulid>,
    doctor_id: Option<Ulid>,
    at: Ms,
}

#[derive(Deserialize)]
struct PatientRequest {
    name: String,
    age: Option<u32>,
    phone: Option<String>,
    address: Option<String>,
}

#[derive(Deserialize)]
struct PatientPatchRequest {
    name: Option<String>,
    age: Option<u32>,
    phone: Option<String>,
    address: Option<String>,
}

#[derive(Deserialize)]
struct DrugRequest {
    name: String,
    strength: Option<String>,
    form: Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    doctor_id: Option<Ulid>,
}

// ── Response shaping ─────────────────────────────────────────────

fn clinical_json(c: &ClinicalFields) -> serde_json::Value {
    json!({
        "diagnosis": &c.diagnosis,
        "advice": &c.advice,
        "chief_complaint": &c.chief_complaint,
        "history": &c.history,
        "exam_findings": c
            .exam_findings
            .as_ref()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok()),
        "investigations": &c.investigations,
        "follow_up": c.follow_up,
    })
}

fn batch_json(b: &VisitBatchInfo) -> serde_json::Value {
    json!({
        "patient_id": b.patient_id,
        "doctor_id": b.doctor_id,
        "recorded_at": b.recorded_at,
        "clinical": clinical_json(&b.clinical),
        "lines": &b.lines,
    })
}

// ── Booking handlers ─────────────────────────────────────────────

async fn book_serial(
    State(state): State<AppState>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    let req: BookSerialRequest = parse_body(&bytes)?;

    // A patient books for themself; staff and doctors say who they book for.
    let patient_id = match caller.role {
        Role::Patient => caller.id,
        _ => req
            .patient_id
            .ok_or_else(|| ApiError::bad_request("patient_id is required"))?,
    };

    match engine
        .book_serial(Ulid::new(), req.schedule_id, patient_id)
        .await
    {
        Ok(serial) => {
            metrics::counter!(observability::BOOKINGS_ACCEPTED_TOTAL).increment(1);
            Ok((
                StatusCode::CREATED,
                Json(json!({
                    "message": "Serial booked successfully.",
                    "serial": serial,
                })),
            ))
        }
        Err(e) => {
            metrics::counter!(
                observability::BOOKINGS_REJECTED_TOTAL,
                "reason" => observability::fault_label(&e)
            )
            .increment(1);
            Err(e.into())
        }
    }
}

async fn set_booking_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
    bytes: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    require_staff(&caller)?;
    let req: BookingStatusRequest = parse_body(&bytes)?;
    engine.set_booking_status(id, req.status).await?;
    Ok(Json(json!({ "message": "Booking updated." })))
}

// ── Schedule handlers ────────────────────────────────────────────

async fn create_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    require_staff(&caller)?;
    let req: ScheduleRequest = parse_body(&bytes)?;

    let doctor_id = match caller.role {
        Role::Doctor => caller.id,
        _ => req
            .doctor_id
            .ok_or_else(|| ApiError::bad_request("doctor_id is required"))?,
    };

    let id = Ulid::new();
    engine
        .create_session(id, doctor_id, Span::new(req.start, req.end), req.capacity)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Schedule created.", "id": id })),
    ))
}

async fn list_schedules(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<ScheduleListQuery>,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    let (engine, _caller) = engine_for(&state, &headers)?;
    let sessions = match q.doctor_id {
        Some(doctor_id) => engine.sessions_for_doctor(doctor_id).await,
        None => engine.list_sessions().await,
    };
    Ok(Json(sessions))
}

async fn update_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
    bytes: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    require_staff(&caller)?;
    let req: ScheduleUpdateRequest = parse_body(&bytes)?;
    engine
        .update_session(id, Span::new(req.start, req.end), req.capacity)
        .await?;
    Ok(Json(json!({ "message": "Schedule updated." })))
}

async fn delete_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    require_staff(&caller)?;
    engine.delete_session(id).await?;
    Ok(Json(json!({ "message": "Schedule deleted." })))
}

async fn schedule_bookings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
) -> Result<Json<Vec<BookingInfo>>, ApiError> {
    let (engine, _caller) = engine_for(&state, &headers)?;
    Ok(Json(engine.get_bookings(id).await?))
}

/// Live feed of a session's booking events for reception dashboards.
async fn schedule_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let (engine, _caller) = engine_for(&state, &headers)?;
    engine
        .get_session(&id)
        .ok_or(EngineError::SessionNotFound(id))?;

    let rx = engine.notify.subscribe(id);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(data) = serde_json::to_string(&event) else {
                        continue;
                    };
                    return Some((Ok(SseEvent::default().data(data)), rx));
                }
                // Skip over missed events; the dashboard re-lists on gaps
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ── Prescription handlers ────────────────────────────────────────

async fn record_prescription(
    State(state): State<AppState>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    require_doctor(&caller)?;
    let req: PrescriptionRequest = parse_body(&bytes)?;

    let (patient_id, recorded_at) = engine
        .record_visit(caller.id, req.patient, req.lines, req.clinical.into_fields())
        .await?;
    metrics::counter!(observability::VISITS_RECORDED_TOTAL).increment(1);
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Prescription saved.",
            "patient_id": patient_id,
            "recorded_at": recorded_at,
        })),
    ))
}

async fn replace_prescription(
    State(state): State<AppState>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    require_doctor(&caller)?;
    let req: PrescriptionReplaceRequest = parse_body(&bytes)?;

    let recorded_at = engine
        .replace_visit(
            caller.id,
            req.patient_id,
            req.original_at,
            req.lines,
            req.clinical.into_fields(),
        )
        .await?;
    metrics::counter!(observability::VISITS_RECORDED_TOTAL).increment(1);
    Ok(Json(json!({
        "message": "Prescription updated.",
        "recorded_at": recorded_at,
    })))
}

/// Reprint lookup: the persisted batch a document renderer regenerates the
/// prescription from.
async fn reprint_prescription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<ReprintQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;

    // Patients may only reprint their own visits; doctors default to their
    // own authorship.
    let patient_id = match caller.role {
        Role::Patient => caller.id,
        _ => q
            .patient_id
            .ok_or_else(|| ApiError::bad_request("patient_id is required"))?,
    };
    let doctor_id = match (caller.role, q.doctor_id) {
        (Role::Doctor, None) => caller.id,
        (_, Some(doctor_id)) => doctor_id,
        (_, None) => return Err(ApiError::bad_request("doctor_id is required")),
    };

    let batch = engine.find_visit(patient_id, doctor_id, q.at).await?;
    Ok(Json(batch_json(&batch)))
}

// ── Patient handlers ─────────────────────────────────────────────

async fn create_patient(
    State(state): State<AppState>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    require_staff(&caller)?;
    let req: PatientRequest = parse_body(&bytes)?;

    let record = PatientRecord {
        id: Ulid::new(),
        name: req.name,
        age: req.age,
        phone: req.phone,
        address: req.address,
    };
    let id = record.id;
    engine.register_patient(record).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Patient registered.", "id": id })),
    ))
}

async fn list_patients(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<PatientRecord>>, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    require_staff(&caller)?;
    Ok(Json(engine.list_patients()))
}

async fn get_patient(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
) -> Result<Json<PatientRecord>, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    if caller.role == Role::Patient && caller.id != id {
        return Err(ApiError::forbidden());
    }
    let patient = engine
        .get_patient(&id)
        .ok_or(EngineError::PatientNotFound(id))?;
    Ok(Json(patient))
}

async fn update_patient(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
    bytes: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    require_staff(&caller)?;
    let req: PatientPatchRequest = parse_body(&bytes)?;

    let existing = engine
        .get_patient(&id)
        .ok_or(EngineError::PatientNotFound(id))?;
    engine
        .update_patient(PatientRecord {
            id,
            name: req.name.unwrap_or(existing.name),
            age: req.age.or(existing.age),
            phone: req.phone.or(existing.phone),
            address: req.address.or(existing.address),
        })
        .await?;
    Ok(Json(json!({ "message": "Patient updated." })))
}

/// The portal's prescription history view.
async fn patient_prescriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    if caller.role == Role::Patient && caller.id != id {
        return Err(ApiError::forbidden());
    }
    let batches = engine.visit_history(id, q.doctor_id).await;
    Ok(Json(batches.iter().map(batch_json).collect()))
}

// ── Drug handlers ────────────────────────────────────────────────

async fn create_drug(
    State(state): State<AppState>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    require_staff(&caller)?;
    let req: DrugRequest = parse_body(&bytes)?;

    let drug = Drug {
        id: Ulid::new(),
        name: req.name,
        strength: req.strength,
        form: req.form,
    };
    let id = drug.id;
    engine.register_drug(drug).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Drug registered.", "id": id })),
    ))
}

async fn list_drugs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Drug>>, ApiError> {
    let (engine, _caller) = engine_for(&state, &headers)?;
    Ok(Json(engine.list_drugs()))
}

async fn remove_drug(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Ulid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (engine, caller) = engine_for(&state, &headers)?;
    require_staff(&caller)?;
    engine.remove_drug(id).await?;
    Ok(Json(json!({ "message": "Drug removed." })))
}

// ── Plumbing ─────────────────────────────────────────────────────

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(
        observability::REQUESTS_TOTAL,
        "route" => route.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "route" => route)
        .record(start.elapsed().as_secs_f64());
    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/bookings", post(book_serial))
        .route("/api/bookings/{id}/status", patch(set_booking_status))
        .route("/api/schedules", post(create_schedule).get(list_schedules))
        .route(
            "/api/schedules/{id}",
            patch(update_schedule).delete(delete_schedule),
        )
        .route("/api/schedules/{id}/bookings", get(schedule_bookings))
        .route("/api/schedules/{id}/events", get(schedule_events))
        .route(
            "/api/prescriptions",
            post(record_prescription)
                .put(replace_prescription)
                .get(reprint_prescription),
        )
        .route("/api/patients", post(create_patient).get(list_patients))
        .route("/api/patients/{id}", get(get_patient).patch(update_patient))
        .route(
            "/api/patients/{id}/prescriptions",
            get(patient_prescriptions),
        )
        .route("/api/drugs", post(create_drug).get(list_drugs))
        .route("/api/drugs/{id}", delete(remove_drug))
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}
