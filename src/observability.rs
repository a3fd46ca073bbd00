use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "timetabled_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "timetabled_query_duration_seconds";

/// Counter: bookings refused because the room was already taken at that slot.
pub const BOOKING_CONFLICTS_TOTAL: &str = "timetabled_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "timetabled_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "timetabled_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "timetabled_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "timetabled_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "timetabled_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "timetabled_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "timetabled_wal_compactions_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertEntry { .. } => "insert_entry",
        Command::UpdateEntry { .. } => "update_entry",
        Command::DeleteEntry { .. } => "delete_entry",
        Command::SelectTimetable => "select_timetable",
        Command::SelectAvailableClassrooms { .. } => "select_available_classrooms",
        Command::InsertClassroom { .. } => "insert_classroom",
        Command::SelectClassrooms => "select_classrooms",
        Command::InsertCourse { .. } => "insert_course",
        Command::DeleteCourse { .. } => "delete_course",
        Command::SelectCourses => "select_courses",
        Command::SelectCourseCatalog => "select_course_catalog",
        Command::InsertSubject { .. } => "insert_subject",
        Command::DeleteSubject { .. } => "delete_subject",
        Command::SelectSubjects { .. } => "select_subjects",
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateStudent { .. } => "update_student",
        Command::DeleteStudent { .. } => "delete_student",
        Command::SelectStudents => "select_students",
        Command::InsertEnrollment { .. } => "insert_enrollment",
        Command::AssignCourse { .. } => "assign_course",
        Command::DeleteEnrollment { .. } => "delete_enrollment",
        Command::SelectEnrollments { .. } => "select_enrollments",
        Command::SelectSession => "select_session",
    }
}
