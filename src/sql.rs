use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
///
/// Tables and the statements each accepts:
///
/// | table | statements |
/// |---|---|
/// | `timetable` | `INSERT (id, course_id, subject_id, classroom_id, day, time_slot)`, `UPDATE SET course_id, classroom_id, day, time_slot WHERE id`, `DELETE WHERE id`, `SELECT` |
/// | `available_classrooms` | `SELECT WHERE day = .. AND time_slot = ..` |
/// | `classrooms` | `INSERT (id, name, capacity)`, `SELECT` |
/// | `courses` | `INSERT (id, code, name)`, `DELETE WHERE id`, `SELECT` |
/// | `course_catalog` | `SELECT` |
/// | `subjects` | `INSERT (id, code, name, course_id)`, `DELETE WHERE id`, `SELECT WHERE course_id` |
/// | `users` | `INSERT (id, name, email, role)` |
/// | `students` | `INSERT (id, name, email)`, `UPDATE SET name, email WHERE id`, `DELETE WHERE id`, `SELECT` |
/// | `enrollments` | `INSERT (student_id, course_id)`, `UPDATE SET course_id WHERE student_id`, `DELETE WHERE student_id AND course_id`, `SELECT WHERE student_id` |
/// | `session` | `SELECT` |
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEntry {
        id: Ulid,
        draft: EntryDraft,
    },
    UpdateEntry {
        id: Ulid,
        update: EntryUpdate,
    },
    DeleteEntry {
        id: Ulid,
    },
    SelectTimetable,
    SelectAvailableClassrooms {
        day: Option<String>,
        time_slot: Option<String>,
    },
    InsertClassroom {
        id: Ulid,
        name: String,
        capacity: u32,
    },
    SelectClassrooms,
    InsertCourse {
        id: Ulid,
        code: String,
        name: String,
    },
    DeleteCourse {
        id: Ulid,
    },
    SelectCourses,
    SelectCourseCatalog,
    InsertSubject {
        id: Ulid,
        code: String,
        name: String,
        course_id: Ulid,
    },
    DeleteSubject {
        id: Ulid,
    },
    SelectSubjects {
        course_id: Option<Ulid>,
    },
    InsertUser {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
    },
    UpdateStudent {
        id: Ulid,
        name: String,
        email: String,
    },
    DeleteStudent {
        id: Ulid,
    },
    SelectStudents,
    InsertEnrollment {
        student_id: Ulid,
        course_id: Ulid,
    },
    /// Replace the student's enrollment with one course.
    AssignCourse {
        student_id: Ulid,
        course_id: Ulid,
    },
    DeleteEnrollment {
        student_id: Ulid,
        course_id: Ulid,
    },
    SelectEnrollments {
        student_id: Option<Ulid>,
    },
    SelectSession,
}

/// Parse a single statement. Prepared statements carry exactly one.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_batch(sql)?;
    if commands.len() > 1 {
        return Err(SqlError::MultipleStatements(commands.len()));
    }
    commands.pop().ok_or(SqlError::Empty)
}

/// Parse every `;`-separated statement of a simple query, in order. One bad
/// statement rejects the whole batch before anything runs.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column → value pairs from an INSERT row, SET list or WHERE conjunction.
struct Fields(Vec<(String, Expr)>);

impl Fields {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(col)?.ok_or(SqlError::MissingValue(col))
    }

    fn opt_ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map_or(Ok(None), |e| parse_ulid_or_null(col, e))
    }

    fn text(&self, col: &'static str) -> Result<String, SqlError> {
        self.opt_text(col)?.ok_or(SqlError::MissingValue(col))
    }

    fn opt_text(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        self.get(col).map_or(Ok(None), |e| parse_text_or_null(col, e))
    }

    fn u32(&self, col: &'static str) -> Result<u32, SqlError> {
        let expr = self.get(col).ok_or(SqlError::MissingValue(col))?;
        parse_u32(col, expr)
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: &[&str] = match table.as_str() {
        "timetable" => &["id", "course_id", "subject_id", "classroom_id", "day", "time_slot"],
        "classrooms" => &["id", "name", "capacity"],
        "courses" => &["id", "code", "name"],
        "subjects" => &["id", "code", "name", "course_id"],
        "users" => &["id", "name", "email", "role"],
        "students" => &["id", "name", "email"],
        "enrollments" => &["student_id", "course_id"],
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = insert_row(insert, &table, columns)?;

    match table.as_str() {
        "timetable" => Ok(Command::InsertEntry {
            id: row.ulid("id")?,
            draft: EntryDraft {
                course_id: row.opt_ulid("course_id")?,
                subject_id: row.opt_ulid("subject_id")?,
                classroom_id: row.opt_ulid("classroom_id")?,
                day: row.opt_text("day")?,
                time_slot: row.opt_text("time_slot")?,
            },
        }),
        "classrooms" => Ok(Command::InsertClassroom {
            id: row.ulid("id")?,
            name: row.text("name")?,
            capacity: row.u32("capacity")?,
        }),
        "courses" => Ok(Command::InsertCourse {
            id: row.ulid("id")?,
            code: row.text("code")?,
            name: row.text("name")?,
        }),
        "subjects" => Ok(Command::InsertSubject {
            id: row.ulid("id")?,
            code: row.text("code")?,
            name: row.text("name")?,
            course_id: row.ulid("course_id")?,
        }),
        "users" => {
            let role = row.text("role")?;
            Ok(Command::InsertUser {
                id: row.ulid("id")?,
                name: row.text("name")?,
                email: row.text("email")?,
                role: role
                    .parse()
                    .map_err(|e: ParseValueError| SqlError::InvalidValue("role", e.to_string()))?,
            })
        }
        "students" => Ok(Command::InsertUser {
            id: row.ulid("id")?,
            name: row.text("name")?,
            email: row.text("email")?,
            role: Role::Student,
        }),
        _ => Ok(Command::InsertEnrollment {
            student_id: row.ulid("student_id")?,
            course_id: row.ulid("course_id")?,
        }),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.push((col, assignment.value.clone()));
    }
    let set = Fields(set);
    let filter = where_fields(selection)?;

    match table.as_str() {
        "timetable" => Ok(Command::UpdateEntry {
            id: filter.ulid("id").map_err(as_missing_filter)?,
            update: EntryUpdate {
                course_id: set.opt_ulid("course_id")?,
                classroom_id: set.opt_ulid("classroom_id")?,
                day: set.opt_text("day")?,
                time_slot: set.opt_text("time_slot")?,
            },
        }),
        "students" => Ok(Command::UpdateStudent {
            id: filter.ulid("id").map_err(as_missing_filter)?,
            name: set.text("name")?,
            email: set.text("email")?,
        }),
        "enrollments" => Ok(Command::AssignCourse {
            student_id: filter.ulid("student_id").map_err(as_missing_filter)?,
            course_id: set.ulid("course_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filter = where_fields(&delete.selection)?;
    let id = || filter.ulid("id").map_err(as_missing_filter);

    match table.as_str() {
        "timetable" => Ok(Command::DeleteEntry { id: id()? }),
        "courses" => Ok(Command::DeleteCourse { id: id()? }),
        "subjects" => Ok(Command::DeleteSubject { id: id()? }),
        "students" => Ok(Command::DeleteStudent { id: id()? }),
        "enrollments" => Ok(Command::DeleteEnrollment {
            student_id: filter.ulid("student_id").map_err(as_missing_filter)?,
            course_id: filter.ulid("course_id").map_err(as_missing_filter)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filter = where_fields(&select.selection)?;

    match table.as_str() {
        "timetable" => Ok(Command::SelectTimetable),
        "available_classrooms" => Ok(Command::SelectAvailableClassrooms {
            day: filter.opt_text("day")?,
            time_slot: filter.opt_text("time_slot")?,
        }),
        "classrooms" => Ok(Command::SelectClassrooms),
        "courses" => Ok(Command::SelectCourses),
        "course_catalog" => Ok(Command::SelectCourseCatalog),
        "subjects" => Ok(Command::SelectSubjects {
            course_id: filter.opt_ulid("course_id")?,
        }),
        "students" => Ok(Command::SelectStudents),
        "enrollments" => Ok(Command::SelectEnrollments {
            student_id: filter.opt_ulid("student_id")?,
        }),
        "session" => Ok(Command::SelectSession),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality filters joined by AND. Any other predicate is rejected rather
/// than silently ignored.
fn where_fields(selection: &Option<Expr>) -> Result<Fields, SqlError> {
    let mut fields = Vec::new();
    if let Some(expr) = selection {
        collect_equalities(expr, &mut fields)?;
    }
    Ok(Fields(fields))
}

fn collect_equalities(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_equalities(left, out)?;
                collect_equalities(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref().clone()));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op} in WHERE"))),
        },
        Expr::Nested(inner) => collect_equalities(inner, out),
        _ => Err(SqlError::Unsupported(format!("WHERE {expr}"))),
    }
}

fn as_missing_filter(e: SqlError) -> SqlError {
    match e {
        SqlError::MissingValue(col) => SqlError::MissingFilter(col),
        other => other,
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// First VALUES row keyed by column. Without a column list, values are taken
/// in the table's declared column order.
fn insert_row(
    insert: &ast::Insert,
    table: &str,
    declared: &[&str],
) -> Result<Fields, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = values
        .rows
        .first()
        .ok_or(SqlError::Parse("empty VALUES".into()))?;
    if values.rows.len() > 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }

    let columns: Vec<String> = if insert.columns.is_empty() {
        declared.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() != columns.len() {
        return Err(SqlError::WrongArity(table.to_string(), columns.len(), row.len()));
    }
    if let Some(unknown) = columns.iter().find(|c| !declared.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(unknown.clone()));
    }
    Ok(Fields(columns.into_iter().zip(row.iter().cloned()).collect()))
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_or_null(col: &'static str, expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match parse_text_or_null(col, expr)? {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => Ulid::from_string(s.trim())
            .map(Some)
            .map_err(|e| SqlError::InvalidValue(col, format!("bad ULID {s:?}: {e}"))),
    }
}

fn parse_text_or_null(col: &'static str, expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::InvalidValue(col, format!("expected string, got {value}"))),
        None => Err(SqlError::InvalidValue(col, format!("expected value, got {expr}"))),
    }
}

fn parse_u32(col: &'static str, expr: &Expr) -> Result<u32, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::InvalidValue(col, format!("bad integer {s:?}: {e}"))),
        Some(Value::Null) => Err(SqlError::MissingValue(col)),
        _ => Err(SqlError::InvalidValue(col, format!("expected integer, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    MultipleStatements(usize),
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(String, usize, usize),
    MissingFilter(&'static str),
    MissingValue(&'static str),
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::MultipleStatements(n) => {
                write!(f, "cannot prepare {n} statements at once")
            }
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingValue(col) => write!(f, "missing value: {col}"),
            SqlError::InvalidValue(col, msg) => write!(f, "invalid value for {col}: {msg}"),
        }
    }
}

impl std::error::Error for SqlError {}
