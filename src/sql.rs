use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, Ident, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::hours;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertHost {
        host: Host,
    },
    InsertWorkingHours {
        rows: Vec<(Ulid, WorkingHoursRule)>,
    },
    DeleteWorkingHours {
        host_id: Ulid,
    },
    UpsertTemplate {
        template: MeetingTemplate,
    },
    InsertTemplateHost {
        template_id: Ulid,
        host: TemplateHost,
    },
    DeleteTemplateHost {
        template_id: Ulid,
        host_id: Ulid,
    },
    InsertConnection {
        id: Ulid,
        host_id: Ulid,
        provider: String,
    },
    /// One successful sync of a calendar connection.
    PublishBusy {
        connection_id: Ulid,
        synced_at: Ms,
        spans: Vec<Span>,
    },
    RecordSyncFailure {
        connection_id: Ulid,
    },
    SelectSlots {
        query: SlotQuery,
    },
    SelectBookingByToken {
        token: String,
    },
    SelectHostBookings {
        host_id: Ulid,
        archived: Option<bool>,
    },
    InsertBooking {
        template_id: Ulid,
        host_id: Ulid,
        start: Ms,
        duration_minutes: u32,
        invitee: Invitee,
        answers: Vec<Answer>,
    },
    SetBookingStatus {
        token: String,
        status: BookingStatus,
        reason: Option<String>,
    },
    RescheduleBooking {
        token: String,
        start: Ms,
        duration_minutes: u32,
    },
    SetArchived {
        token: String,
        archived: bool,
    },
    ArchiveAll {
        host_id: Ulid,
    },
    SelectSyncHealth {
        host_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row addressed by the INSERT's column list.
struct Row<'a> {
    columns: &'a [Ident],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c.value.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    /// Column value, treating an absent column like NULL.
    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.get(column).filter(|e| !is_null(e))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
    }
    let all_rows = extract_all_insert_rows(insert)?;
    let rows: Vec<Row> = all_rows
        .iter()
        .map(|values| Row {
            columns: &insert.columns,
            values,
        })
        .collect();

    match table.as_str() {
        "hosts" => {
            let row = single_row("hosts", &rows)?;
            Ok(Command::UpsertHost {
                host: Host {
                    id: parse_ulid(row.require("id")?)?,
                    name: row.optional("name").map(parse_string).transpose()?,
                    timezone: parse_string(row.require("timezone")?)?,
                    default_buffers: Buffers {
                        pre_minutes: row.optional("pre_buffer").map(parse_u32).transpose()?.unwrap_or(0),
                        post_minutes: row.optional("post_buffer").map(parse_u32).transpose()?.unwrap_or(0),
                    },
                },
            })
        }
        "working_hours" => {
            let mut parsed = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                parsed.push(parse_working_hours_row(row).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?);
            }
            Ok(Command::InsertWorkingHours { rows: parsed })
        }
        "templates" => {
            let row = single_row("templates", &rows)?;
            Ok(Command::UpsertTemplate {
                template: parse_template_row(row)?,
            })
        }
        "template_hosts" => {
            let row = single_row("template_hosts", &rows)?;
            Ok(Command::InsertTemplateHost {
                template_id: parse_ulid(row.require("template_id")?)?,
                host: TemplateHost {
                    host_id: parse_ulid(row.require("host_id")?)?,
                    optional: row.optional("optional").map(parse_bool).transpose()?.unwrap_or(false),
                },
            })
        }
        "calendar_connections" => {
            let row = single_row("calendar_connections", &rows)?;
            Ok(Command::InsertConnection {
                id: parse_ulid(row.require("id")?)?,
                host_id: parse_ulid(row.require("host_id")?)?,
                provider: parse_string(row.require("provider")?)?,
            })
        }
        "calendar_busy" => parse_busy_rows(&rows),
        "bookings" => {
            let row = single_row("bookings", &rows)?;
            Ok(Command::InsertBooking {
                template_id: parse_ulid(row.require("template_id")?)?,
                host_id: parse_ulid(row.require("host_id")?)?,
                start: parse_i64(row.require("start")?)?,
                duration_minutes: parse_u32(row.require("duration")?)?,
                invitee: Invitee {
                    name: parse_string(row.require("invitee_name")?)?,
                    email: parse_string(row.require("invitee_email")?)?,
                    timezone: row.optional("invitee_timezone").map(parse_string).transpose()?,
                },
                answers: match row.optional("answers") {
                    Some(expr) => parse_answers(&parse_string(expr)?)?,
                    None => Vec::new(),
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn single_row<'r, 'a>(table: &'static str, rows: &'r [Row<'a>]) -> Result<&'r Row<'a>, SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

/// One sync snapshot. Every row names the same connection and `synced_at`; a
/// row with neither `start` nor `"end"` adds no span, which is how an empty
/// calendar is published.
fn parse_busy_rows(rows: &[Row]) -> Result<Command, SqlError> {
    let first = rows.first().ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    let connection_id = parse_ulid(first.require("connection_id")?)?;
    let synced_at = parse_i64(first.require("synced_at")?)?;
    let mut spans = Vec::with_capacity(rows.len());
    for row in rows {
        if parse_ulid(row.require("connection_id")?)? != connection_id
            || parse_i64(row.require("synced_at")?)? != synced_at
        {
            return Err(SqlError::Unsupported(
                "calendar_busy rows must share connection_id and synced_at".into(),
            ));
        }
        match (row.optional("start"), row.optional("end")) {
            (None, None) => {}
            (Some(start), Some(end)) => {
                let (start, end) = (parse_i64(start)?, parse_i64(end)?);
                let span = Span::try_new(start, end)
                    .ok_or_else(|| SqlError::Parse(format!("empty busy span {start}..{end}")))?;
                spans.push(span);
            }
            (None, Some(_)) => return Err(SqlError::MissingColumn("start")),
            (Some(_), None) => return Err(SqlError::MissingColumn("end")),
        }
    }
    Ok(Command::PublishBusy {
        connection_id,
        synced_at,
        spans,
    })
}

/// JSON array of `{"question": .., "response": ..}`.
fn parse_answers(json: &str) -> Result<Vec<Answer>, SqlError> {
    serde_json::from_str(json).map_err(|e| SqlError::Parse(format!("bad answers: {e}")))
}

fn parse_working_hours_row(row: &Row) -> Result<(Ulid, WorkingHoursRule), SqlError> {
    let host_id = parse_ulid(row.require("host_id")?)?;
    let weekday = parse_u32(row.require("weekday")?)?;
    let weekday = u8::try_from(weekday).map_err(|_| SqlError::Parse(format!("weekday {weekday} out of range")))?;
    let start = parse_string(row.require("start")?)?;
    let end = parse_string(row.require("end")?)?;
    Ok((
        host_id,
        WorkingHoursRule {
            weekday,
            start_minute: hours::parse_hhmm(&start).map_err(|e| SqlError::Parse(e.to_string()))?,
            end_minute: hours::parse_hhmm(&end).map_err(|e| SqlError::Parse(e.to_string()))?,
            enabled: row.optional("enabled").map(parse_bool).transpose()?.unwrap_or(true),
        },
    ))
}

fn parse_template_row(row: &Row) -> Result<MeetingTemplate, SqlError> {
    let availability_rules = match row.optional("availability_rules") {
        Some(expr) => {
            let json = parse_string(expr)?;
            Some(hours::parse_availability_rules(&json).map_err(|e| SqlError::Parse(e.to_string()))?)
        }
        None => None,
    };
    Ok(MeetingTemplate {
        id: parse_ulid(row.require("id")?)?,
        host_id: parse_ulid(row.require("host_id")?)?,
        name: row.optional("name").map(parse_string).transpose()?,
        durations: parse_durations(row.require("durations")?)?,
        min_notice_minutes: row.optional("min_notice").map(parse_u32).transpose()?.unwrap_or(0),
        max_schedule_days: row.optional("max_days").map(parse_u32).transpose()?.unwrap_or(60),
        pre_buffer_minutes: row.optional("pre_buffer").map(parse_u32).transpose()?,
        post_buffer_minutes: row.optional("post_buffer").map(parse_u32).transpose()?,
        requires_approval: row
            .optional("requires_approval")
            .map(parse_bool)
            .transpose()?
            .unwrap_or(false),
        active: row.optional("active").map(parse_bool).transpose()?.unwrap_or(true),
        private: row.optional("private").map(parse_bool).transpose()?.unwrap_or(false),
        availability_rules,
        pooled: Vec::new(),
    })
}

/// `'30,60'` or a bare number.
fn parse_durations(expr: &Expr) -> Result<Vec<u32>, SqlError> {
    let text = match extract_value(expr) {
        Some(Value::Number(n, _)) => n.clone(),
        Some(Value::SingleQuotedString(s)) => s.clone(),
        _ => return Err(SqlError::Parse(format!("expected duration list, got {expr}"))),
    };
    text.split(',')
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .map_err(|e| SqlError::Parse(format!("bad duration {part:?}: {e}")))
        })
        .collect()
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "working_hours" => Ok(Command::DeleteWorkingHours {
            host_id: parse_ulid(filters.require_eq("host_id")?)?,
        }),
        "template_hosts" => Ok(Command::DeleteTemplateHost {
            template_id: parse_ulid(filters.require_eq("template_id")?)?,
            host_id: parse_ulid(filters.require_eq("host_id")?)?,
        }),
        "bookings" => Err(SqlError::Unsupported("bookings are never deleted; cancel or archive instead".into())),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            query: SlotQuery {
                host_id: parse_ulid(filters.require_eq("host_id")?)?,
                template_id: parse_ulid(filters.require_eq("template_id")?)?,
                start: parse_i64(filters.ge("start").ok_or(SqlError::MissingFilter("start"))?)?,
                end: parse_i64(filters.le("end").ok_or(SqlError::MissingFilter("end"))?)?,
                duration_minutes: filters.eq("duration").map(parse_u32).transpose()?.unwrap_or(0),
                timezone: filters.eq("timezone").map(parse_string).transpose()?,
            },
        }),
        "bookings" => {
            if let Some(token) = filters.eq("token") {
                return Ok(Command::SelectBookingByToken {
                    token: parse_string(token)?,
                });
            }
            Ok(Command::SelectHostBookings {
                host_id: parse_ulid(filters.require_eq("host_id")?)?,
                archived: filters.eq("archived").map(parse_bool).transpose()?,
            })
        }
        "sync_health" => Ok(Command::SelectSyncHealth {
            host_id: parse_ulid(filters.require_eq("host_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "bookings" && table != "calendar_connections" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = Filters::from_selection(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let AssignmentTarget::ColumnName(name) = &a.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let column = object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?;
        set.push((column, &a.value));
    }
    let assigned = |column: &str| set.iter().find(|(c, _)| c == column).map(|(_, e)| *e);

    if table == "calendar_connections" {
        let status = parse_string(assigned("sync_status").ok_or(SqlError::MissingColumn("sync_status"))?)?;
        if status != "failed" {
            return Err(SqlError::Unsupported(format!(
                "sync_status = '{status}'; successful syncs are published through calendar_busy"
            )));
        }
        return Ok(Command::RecordSyncFailure {
            connection_id: parse_ulid(filters.require_eq("id")?)?,
        });
    }

    if let Some(archived) = assigned("archived") {
        let archived = parse_bool(archived)?;
        if let Some(token) = filters.eq("token") {
            return Ok(Command::SetArchived {
                token: parse_string(token)?,
                archived,
            });
        }
        let host_id = parse_ulid(filters.require_eq("host_id")?)?;
        if !archived {
            return Err(SqlError::Unsupported("bulk unarchive".into()));
        }
        return Ok(Command::ArchiveAll { host_id });
    }

    let token = parse_string(filters.require_eq("token")?)?;
    if let Some(status) = assigned("status") {
        let text = parse_string(status)?;
        let status = BookingStatus::parse(&text).ok_or_else(|| SqlError::Parse(format!("unknown status: {text}")))?;
        return Ok(Command::SetBookingStatus {
            token,
            status,
            reason: assigned("reason").filter(|e| !is_null(e)).map(parse_string).transpose()?,
        });
    }
    if let Some(start) = assigned("start") {
        return Ok(Command::RescheduleBooking {
            token,
            start: parse_i64(start)?,
            duration_minutes: parse_u32(assigned("duration").ok_or(SqlError::MissingColumn("duration"))?)?,
        });
    }
    Err(SqlError::Unsupported("UPDATE bookings must set status, start, or archived".into()))
}

// ── WHERE clauses ─────────────────────────────────────────────

/// Column comparisons from an AND-only WHERE clause.
#[derive(Default)]
struct Filters<'a> {
    eq: Vec<(String, &'a Expr)>,
    ge: Vec<(String, &'a Expr)>,
    le: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                if *op == ast::BinaryOperator::And {
                    self.collect(left)?;
                    return self.collect(right);
                }
                let column =
                    expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                match op {
                    ast::BinaryOperator::Eq => self.eq.push((column, right.as_ref())),
                    ast::BinaryOperator::GtEq => self.ge.push((column, right.as_ref())),
                    ast::BinaryOperator::LtEq => self.le.push((column, right.as_ref())),
                    _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
                }
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
    }

    fn find(list: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
        list.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        Self::find(&self.eq, column)
    }

    fn ge(&self, column: &str) -> Option<&'a Expr> {
        Self::find(&self.ge, column)
    }

    fn le(&self, column: &str) -> Option<&'a Expr> {
        Self::find(&self.le, column)
    }

    fn require_eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.eq(column).ok_or(SqlError::MissingFilter(column))
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
