use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total HTTP requests. Labels: route, status.
pub const REQUESTS_TOTAL: &str = "medlipi_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const REQUEST_DURATION_SECONDS: &str = "medlipi_request_duration_seconds";

/// Counter: serials handed out.
pub const BOOKINGS_ACCEPTED_TOTAL: &str = "medlipi_bookings_accepted_total";

/// Counter: bookings turned away. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "medlipi_bookings_rejected_total";

/// Counter: visit batches written (create + replace).
pub const VISITS_RECORDED_TOTAL: &str = "medlipi_visits_recorded_total";

/// Counter: auth failures (bad token, bad identity headers).
pub const AUTH_FAILURES_TOTAL: &str = "medlipi_auth_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of active clinics (loaded engines).
pub const CLINICS_ACTIVE: &str = "medlipi_clinics_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "medlipi_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "medlipi_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map an engine fault to a short label for the rejection counters.
pub fn fault_label(e: &EngineError) -> &'static str {
    match e {
        EngineError::SessionNotFound(_) => "session_not_found",
        EngineError::DuplicateBooking { .. } => "duplicate_booking",
        EngineError::SessionFull(_) => "session_full",
        EngineError::BookingNotFound(_) => "booking_not_found",
        EngineError::InvalidStatusChange { .. } => "invalid_status_change",
        EngineError::HasActiveBookings(_) => "has_active_bookings",
        EngineError::OverlappingSession(_) => "overlapping_session",
        EngineError::CapacityBelowActive { .. } => "capacity_below_active",
        EngineError::PatientNotFound(_) => "patient_not_found",
        EngineError::DrugNotFound(_) => "drug_not_found",
        EngineError::VisitNotFound { .. } => "visit_not_found",
        EngineError::AlreadyExists(_) => "already_exists",
        EngineError::InvalidInput(_) => "invalid_input",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::WalError(_) => "wal_error",
    }
}
