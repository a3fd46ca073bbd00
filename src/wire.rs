use std::fmt::Debug;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{
    ClientInfo, ClientPortalStore, METADATA_USER, NoopHandler, PgWireServerHandlers, Type,
};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, info};
use ulid::Ulid;

use crate::auth::TimetableAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::session;
use crate::sql::{self, Command, SqlError};

/// Query handler for one connection. The credential lives here, on the
/// server side, so nothing the client sends at startup can stand in for it.
pub struct TimetableHandler {
    engine: Arc<Engine>,
    query_parser: Arc<TimetableQueryParser>,
    credential: OnceLock<Credential>,
}

impl TimetableHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(TimetableQueryParser),
            credential: OnceLock::new(),
        }
    }

    /// The session's credential: issued on its first statement for the
    /// authenticated login, then reused unchanged.
    fn session_credential<C: ClientInfo>(&self, client: &C) -> PgWireResult<Credential> {
        if let Some(credential) = self.credential.get() {
            return Ok(credential.clone());
        }
        let email = client
            .metadata()
            .get(METADATA_USER)
            .ok_or_else(|| user_error("FATAL", "28000", "no user in startup message".into()))?;
        let credential = session::issue(&self.engine, email).map_err(engine_err)?;
        info!("issued {} credential for {email}", credential.role());
        Ok(self.credential.get_or_init(|| credential).clone())
    }

    /// Run a simple-query batch statement by statement. Execution stops at the
    /// first failure; statements before it stay committed.
    async fn run_batch<C: ClientInfo>(
        &self,
        client: &C,
        query: &str,
    ) -> PgWireResult<Vec<Response>> {
        let commands = match sql::parse_batch(query) {
            Ok(commands) => commands,
            Err(e) => {
                record_query("invalid", false, Instant::now());
                debug!("rejected query: {e}");
                return Err(sql_err(e));
            }
        };
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            match self.run_command(client, cmd).await {
                Ok(mut done) => responses.append(&mut done),
                Err(e) if responses.is_empty() => return Err(e),
                Err(PgWireError::UserError(info)) => {
                    responses.push(Response::Error(info));
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(responses)
    }

    async fn run_command<C: ClientInfo>(
        &self,
        client: &C,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let start = Instant::now();
        let label = observability::command_label(&cmd);
        let result = match self.session_credential(client) {
            Ok(credential) => self.execute_command(&credential, cmd).await,
            Err(e) => Err(e),
        };
        record_query(label, result.is_ok(), start);
        if let Err(e) = &result {
            debug!("{label} failed: {e}");
        }
        result
    }

    async fn execute_command(
        &self,
        credential: &Credential,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let engine = &*self.engine;
        let admin = || credential.require_admin().map_err(engine_err);

        match cmd {
            Command::InsertEntry { id, draft } => {
                admin()?;
                engine
                    .create_timetable_entry(id, draft)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::UpdateEntry { id, update } => {
                admin()?;
                engine
                    .update_timetable_entry(id, update)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("UPDATE", 1)])
            }
            Command::DeleteEntry { id } => {
                admin()?;
                engine.delete_timetable_entry(id).await.map_err(engine_err)?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::SelectTimetable => {
                let rows = engine.list_timetable(credential).await;
                let schema = Arc::new(timetable_schema());
                query_response(schema, rows, |enc, row| {
                    enc.encode_field(&row.id.to_string())?;
                    enc.encode_field(&row.course_name)?;
                    enc.encode_field(&row.subject_name)?;
                    enc.encode_field(&row.room_name)?;
                    enc.encode_field(&row.day.as_str())?;
                    enc.encode_field(&row.slot.to_string())
                })
            }
            Command::SelectAvailableClassrooms { day, time_slot } => {
                let rooms = engine
                    .available_classrooms(day.as_deref(), time_slot.as_deref())
                    .await
                    .map_err(engine_err)?;
                classroom_rows(rooms)
            }
            Command::InsertClassroom { id, name, capacity } => {
                admin()?;
                engine
                    .create_classroom(id, name, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::SelectClassrooms => classroom_rows(engine.list_classrooms().await),
            Command::InsertCourse { id, code, name } => {
                admin()?;
                engine.create_course(id, code, name).await.map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::DeleteCourse { id } => {
                admin()?;
                engine.delete_course(id).await.map_err(engine_err)?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::SelectCourses => course_rows(engine.list_courses()),
            Command::SelectCourseCatalog => {
                let schema = Arc::new(course_catalog_schema());
                let mut rows: Vec<(Course, Option<Subject>)> = Vec::new();
                for group in engine.courses_with_subjects() {
                    if group.subjects.is_empty() {
                        rows.push((group.course, None));
                        continue;
                    }
                    for subject in group.subjects {
                        rows.push((group.course.clone(), Some(subject)));
                    }
                }
                query_response(schema, rows, |enc, (course, subject)| {
                    enc.encode_field(&course.id.to_string())?;
                    enc.encode_field(&course.code)?;
                    enc.encode_field(&course.name)?;
                    enc.encode_field(&subject.as_ref().map(|s| s.id.to_string()))?;
                    enc.encode_field(&subject.as_ref().map(|s| s.code.clone()))?;
                    enc.encode_field(&subject.as_ref().map(|s| s.name.clone()))
                })
            }
            Command::InsertSubject {
                id,
                code,
                name,
                course_id,
            } => {
                admin()?;
                engine
                    .create_subject(id, code, name, course_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::DeleteSubject { id } => {
                admin()?;
                engine.delete_subject(id).await.map_err(engine_err)?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::SelectSubjects { course_id } => {
                let subjects = engine.list_subjects(course_id).map_err(engine_err)?;
                let schema = Arc::new(subjects_schema());
                query_response(schema, subjects, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.code)?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&s.course_id.to_string())
                })
            }
            Command::InsertUser {
                id,
                name,
                email,
                role,
            } => {
                admin()?;
                engine
                    .register_user(id, name, email, role)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::UpdateStudent { id, name, email } => {
                admin()?;
                engine
                    .update_student(id, name, email)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("UPDATE", 1)])
            }
            Command::DeleteStudent { id } => {
                admin()?;
                engine.delete_student(id).await.map_err(engine_err)?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::SelectStudents => {
                admin()?;
                let schema = Arc::new(students_schema());
                query_response(schema, engine.list_students(), |enc, row| {
                    enc.encode_field(&row.id.to_string())?;
                    enc.encode_field(&row.name)?;
                    enc.encode_field(&row.email)?;
                    enc.encode_field(&row.course_id.map(|c| c.to_string()))?;
                    enc.encode_field(&row.course_name)
                })
            }
            Command::InsertEnrollment {
                student_id,
                course_id,
            } => {
                admin()?;
                engine.enroll(student_id, course_id).await.map_err(engine_err)?;
                Ok(vec![execution("INSERT", 1)])
            }
            Command::AssignCourse {
                student_id,
                course_id,
            } => {
                admin()?;
                engine
                    .assign_course(student_id, course_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("UPDATE", 1)])
            }
            Command::DeleteEnrollment {
                student_id,
                course_id,
            } => {
                admin()?;
                engine
                    .unenroll(student_id, course_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![execution("DELETE", 1)])
            }
            Command::SelectEnrollments { student_id } => {
                // Students may look up their own courses only.
                let student_id = match credential {
                    Credential::Admin { .. } => student_id,
                    Credential::Student { user_id, .. } => match student_id {
                        Some(sid) if sid != *user_id => {
                            return Err(engine_err(EngineError::Forbidden(
                                "students may only list their own courses",
                            )));
                        }
                        _ => Some(*user_id),
                    },
                };
                course_rows(engine.student_courses(student_id).map_err(engine_err)?)
            }
            Command::SelectSession => {
                let schema = Arc::new(session_schema());
                let course_ids = match credential {
                    Credential::Admin { .. } => None,
                    Credential::Student { course_ids, .. } => Some(
                        course_ids
                            .iter()
                            .map(Ulid::to_string)
                            .collect::<Vec<_>>()
                            .join(","),
                    ),
                };
                let token = session::encode(credential)
                    .map_err(|e| user_error("ERROR", "XX000", e.to_string()))?;
                query_response(schema, [credential], |enc, c| {
                    enc.encode_field(&c.user_id().to_string())?;
                    enc.encode_field(&c.role().as_str())?;
                    enc.encode_field(&course_ids)?;
                    enc.encode_field(&token)
                })
            }
        }
    }
}

fn record_query(label: &'static str, ok: bool, start: Instant) {
    let status = if ok { "ok" } else { "error" };
    metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
        .increment(1);
    metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
        .record(start.elapsed().as_secs_f64());
}

fn execution(tag: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(tag).with_rows(rows))
}

fn query_response<T>(
    schema: Arc<Vec<FieldInfo>>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Vec<Response>> {
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    ))])
}

fn classroom_rows(rooms: Vec<ClassroomInfo>) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(classrooms_schema());
    query_response(schema, rooms, |enc, room| {
        enc.encode_field(&room.id.to_string())?;
        enc.encode_field(&room.name)?;
        enc.encode_field(&(room.capacity as i32))
    })
}

fn course_rows(courses: Vec<Course>) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(courses_schema());
    query_response(schema, courses, |enc, c| {
        enc.encode_field(&c.id.to_string())?;
        enc.encode_field(&c.code)?;
        enc.encode_field(&c.name)
    })
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn timetable_schema() -> Vec<FieldInfo> {
    ["id", "course_name", "subject_name", "room_name", "day", "time_slot"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn classrooms_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        FieldInfo::new("capacity".into(), None, None, Type::INT4, FieldFormat::Text),
    ]
}

fn courses_schema() -> Vec<FieldInfo> {
    ["id", "code", "name"].into_iter().map(text_field).collect()
}

fn course_catalog_schema() -> Vec<FieldInfo> {
    [
        "course_id",
        "course_code",
        "course_name",
        "subject_id",
        "subject_code",
        "subject_name",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn subjects_schema() -> Vec<FieldInfo> {
    ["id", "code", "name", "course_id"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn students_schema() -> Vec<FieldInfo> {
    ["id", "name", "email", "course_id", "course_name"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn session_schema() -> Vec<FieldInfo> {
    ["user_id", "role", "course_ids", "credential"]
        .into_iter()
        .map(text_field)
        .collect()
}

/// Row description for a command; writes return none.
fn result_schema(cmd: &Command) -> Vec<FieldInfo> {
    match cmd {
        Command::SelectTimetable => timetable_schema(),
        Command::SelectAvailableClassrooms { .. } | Command::SelectClassrooms => {
            classrooms_schema()
        }
        Command::SelectCourses | Command::SelectEnrollments { .. } => courses_schema(),
        Command::SelectCourseCatalog => course_catalog_schema(),
        Command::SelectSubjects { .. } => subjects_schema(),
        Command::SelectStudents => students_schema(),
        Command::SelectSession => session_schema(),
        _ => vec![],
    }
}

/// Describe a statement before its parameters are bound: placeholders are
/// read as NULL, which every SELECT filter accepts.
fn describe_schema(stmt: &str) -> Vec<FieldInfo> {
    let sql = bind_placeholders(stmt, |_| Some("NULL".to_string()));
    sql::parse_sql(&sql)
        .map(|cmd| result_schema(&cmd))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for TimetableHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run_batch(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TimetableQueryParser;

#[async_trait]
impl QueryParser for TimetableQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TimetableHandler {
    type Statement = String;
    type QueryParser = TimetableQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(|e| {
            record_query("invalid", false, Instant::now());
            sql_err(e)
        })?;
        let mut responses = self.run_command(client, cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            describe_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
        )))
    }
}

/// Byte spans and numbers of the `$N` placeholders outside string literals.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start, i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

/// Highest `$N` in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Replace every placeholder in one left-to-right pass, so bound text is
/// never rescanned. `None` leaves the placeholder as written.
fn bind_placeholders(sql: &str, value: impl Fn(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        if let Some(v) = value(n) {
            out.push_str(&sql[copied..start]);
            out.push_str(&v);
            copied = end;
        }
    }
    out.push_str(&sql[copied..]);
    out
}

/// Bound parameters (text format) as SQL literals.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_placeholders(&portal.statement.statement, |n| {
        let param = portal.parameters.get(n.checked_sub(1)?)?;
        Some(match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        })
    })
}

// ── Factory ──────────────────────────────────────────────────────

type AuthHandler =
    CleartextPasswordAuthStartupHandler<TimetableAuthSource, DefaultServerParameterProvider>;

/// Shared server state. Each connection gets its own handler through
/// [`TimetableFactory::for_connection`].
#[derive(Clone)]
pub struct TimetableFactory {
    engine: Arc<Engine>,
    handler: Arc<TimetableHandler>,
    auth_handler: Arc<AuthHandler>,
    noop: Arc<NoopHandler>,
}

impl TimetableFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = TimetableAuthSource::new(engine.clone(), password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TimetableHandler::new(engine.clone())),
            engine,
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }

    /// Same engine and login check, fresh session state.
    pub fn for_connection(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            handler: Arc::new(TimetableHandler::new(self.engine.clone())),
            auth_handler: self.auth_handler.clone(),
            noop: self.noop.clone(),
        }
    }
}

impl PgWireServerHandlers for TimetableFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: &TimetableFactory,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory.for_connection()).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(severity: &str, code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        severity.into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::MissingParameter(_) | EngineError::InvalidParameter(_) => "22023",
        EngineError::SlotAlreadyBooked { .. } | EngineError::AlreadyExists(_) => "23505",
        EngineError::InUse(_) => "23503",
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::StorageFailure(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error("ERROR", sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::Parse(_)
        | SqlError::Empty
        | SqlError::WrongArity(..)
        | SqlError::MultipleStatements(_) => "42601",
        SqlError::Unsupported(_) => "0A000",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::MissingFilter(_) | SqlError::MissingValue(_) => "22023",
        SqlError::InvalidValue(..) => "22P02",
    };
    user_error("ERROR", code, e.to_string())
}
