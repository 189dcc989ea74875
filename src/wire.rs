use std::fmt::Debug;
use std::io;
use std::sync::Arc;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::{SlotbookAuthSource, actor_for_user};
use crate::busy::{self, SyncCache};
use crate::engine::{Engine, EngineError, now_ms};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    calendars: Arc<SyncCache>,
    stale_sync_after: Ms,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>, calendars: Arc<SyncCache>, stale_sync_after: Ms) -> Self {
        Self {
            engine,
            calendars,
            stale_sync_after,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    fn actor<C: ClientInfo>(client: &C) -> Actor {
        actor_for_user(client.metadata().get("user").map(String::as_str))
    }

    async fn run(&self, actor: Actor, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: Actor, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        let now = now_ms();
        match cmd {
            Command::UpsertHost { host } => {
                require_host(actor, host.id)?;
                engine.upsert_host(host).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertWorkingHours { rows } => {
                let count = rows.len();
                let mut by_host: Vec<(Ulid, Vec<WorkingHoursRule>)> = Vec::new();
                for (host_id, rule) in rows {
                    require_host(actor, host_id)?;
                    match by_host.iter_mut().find(|(h, _)| *h == host_id) {
                        Some((_, rules)) => rules.push(rule),
                        None => by_host.push((host_id, vec![rule])),
                    }
                }
                for (host_id, rules) in by_host {
                    engine.add_working_hours(host_id, rules).await.map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::DeleteWorkingHours { host_id } => {
                require_host(actor, host_id)?;
                engine.clear_working_hours(host_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE"))])
            }
            Command::UpsertTemplate { template } => {
                require_host(actor, template.host_id)?;
                engine.upsert_template(template).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertTemplateHost { template_id, host } => {
                self.require_template_owner(actor, &template_id)?;
                engine.add_template_host(template_id, host).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteTemplateHost { template_id, host_id } => {
                self.require_template_owner(actor, &template_id)?;
                engine
                    .remove_template_host(template_id, host_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertConnection { id, host_id, provider } => {
                require_host(actor, host_id)?;
                engine
                    .upsert_connection(CalendarConnection {
                        id,
                        host_id,
                        provider,
                        sync_status: SyncStatus::Unknown,
                        last_synced_at: None,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::PublishBusy {
                connection_id,
                synced_at,
                spans,
            } => {
                self.require_connection_owner(actor, &connection_id)?;
                busy::validate_snapshot(synced_at, &spans).map_err(engine_err)?;
                let count = spans.len();
                if self.calendars.publish(connection_id, synced_at, spans) {
                    engine
                        .record_sync(connection_id, SyncOutcome::Synced { at: synced_at })
                        .await
                        .map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::RecordSyncFailure { connection_id } => {
                self.require_connection_owner(actor, &connection_id)?;
                engine
                    .record_sync(connection_id, SyncOutcome::Failed { at: now })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectSlots { query } => {
                let slots = engine.compute_slots(&query, now).await.map_err(engine_err)?;
                let schema = Arc::new(slot_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        encoder.encode_field(&slot.local_start.to_rfc3339())?;
                        encoder.encode_field(&slot.local_end.to_rfc3339())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBookingByToken { token } => {
                let receipt = engine.booking_by_token(&token).await.map_err(engine_err)?;
                Ok(vec![booking_rows(vec![receipt.booking])])
            }
            Command::SelectHostBookings { host_id, archived } => {
                require_host(actor, host_id)?;
                let bookings = engine
                    .bookings_for_host(host_id, archived)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_rows(bookings)])
            }
            Command::InsertBooking {
                template_id,
                host_id,
                start,
                duration_minutes,
                invitee,
                answers,
            } => {
                let receipt = engine
                    .create_booking(
                        CreateBookingInput {
                            template_id,
                            host_id,
                            start,
                            duration_minutes,
                            invitee,
                            answers,
                        },
                        now,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![booking_rows(vec![receipt.booking])])
            }
            Command::SetBookingStatus { token, status, reason } => {
                let result = match status {
                    BookingStatus::Confirmed => engine.approve_booking(&token, actor, now).await,
                    BookingStatus::Rejected => {
                        engine
                            .reject_booking(&token, actor, reason.unwrap_or_default(), now)
                            .await
                    }
                    BookingStatus::Cancelled => engine.cancel_booking(&token, actor, reason, now).await,
                    BookingStatus::Pending => Err(EngineError::InvalidTransition {
                        action: "set pending",
                        status,
                    }),
                };
                result.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::RescheduleBooking {
                token,
                start,
                duration_minutes,
            } => {
                engine
                    .reschedule_booking(
                        RescheduleBookingInput {
                            token,
                            new_start: start,
                            new_duration_minutes: duration_minutes,
                        },
                        actor,
                        now,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SetArchived { token, archived } => {
                let result = if archived {
                    engine.archive_booking(&token, actor, now).await
                } else {
                    engine.unarchive_booking(&token, actor, now).await
                };
                result.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::ArchiveAll { host_id } => {
                let count = engine.archive_all(host_id, actor, now).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(count))])
            }
            Command::SelectSyncHealth { host_id } => {
                require_host(actor, host_id)?;
                let health = engine
                    .sync_health(host_id, now, self.stale_sync_after)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(sync_health_schema());
                let rows: Vec<PgWireResult<_>> = health
                    .into_iter()
                    .map(|h| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&h.connection_id.to_string())?;
                        encoder.encode_field(&h.provider)?;
                        encoder.encode_field(&h.sync_status.as_str())?;
                        encoder.encode_field(&h.last_synced_at)?;
                        encoder.encode_field(&h.stale)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }

    fn require_template_owner(&self, actor: Actor, template_id: &Ulid) -> PgWireResult<()> {
        let template = self
            .engine
            .get_template(template_id)
            .ok_or_else(|| engine_err(EngineError::HostOrTemplateNotFound(*template_id)))?;
        require_host(actor, template.host_id)
    }

    fn require_connection_owner(&self, actor: Actor, connection_id: &Ulid) -> PgWireResult<()> {
        let host_id = self.engine.connection_owner(connection_id).ok_or_else(|| {
            engine_err(EngineError::InvalidInput(format!("unknown calendar connection {connection_id}")))
        })?;
        require_host(actor, host_id)
    }
}

fn require_host(actor: Actor, host_id: Ulid) -> PgWireResult<()> {
    if actor == Actor::Host(host_id) {
        Ok(())
    } else {
        Err(user_error("42501", format!("connect as host {host_id} to change or list its data")))
    }
}

fn booking_rows(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.token)?;
            encoder.encode_field(&b.template_id.to_string())?;
            encoder.encode_field(&b.host_id.to_string())?;
            encoder.encode_field(&b.start)?;
            encoder.encode_field(&b.end)?;
            encoder.encode_field(&i64::from(b.duration_minutes))?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.archived)?;
            encoder.encode_field(&b.invitee.name)?;
            encoder.encode_field(&b.invitee.email)?;
            encoder.encode_field(&b.cancelled_by.map(actor_label))?;
            encoder.encode_field(&b.cancel_reason)?;
            encoder.encode_field(&b.reject_reason)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn actor_label(actor: Actor) -> String {
    match actor {
        Actor::Host(id) => id.to_string(),
        Actor::Invitee => "invitee".into(),
    }
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("local_start", Type::VARCHAR),
        text_field("local_end", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("token", Type::VARCHAR),
        text_field("template_id", Type::VARCHAR),
        text_field("host_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("duration", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("archived", Type::BOOL),
        text_field("invitee_name", Type::VARCHAR),
        text_field("invitee_email", Type::VARCHAR),
        text_field("cancelled_by", Type::VARCHAR),
        text_field("cancel_reason", Type::VARCHAR),
        text_field("reject_reason", Type::VARCHAR),
    ]
}

fn sync_health_schema() -> Vec<FieldInfo> {
    vec![
        text_field("connection_id", Type::VARCHAR),
        text_field("provider", Type::VARCHAR),
        text_field("sync_status", Type::VARCHAR),
        text_field("last_synced_at", Type::INT8),
        text_field("stale", Type::BOOL),
    ]
}

/// Result columns for a statement, judged from its text so it works before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    let reads = upper.starts_with("SELECT");
    if reads && upper.contains("SLOTS") {
        slot_schema()
    } else if reads && upper.contains("SYNC_HEALTH") {
        sync_health_schema()
    } else if upper.contains("BOOKINGS") && (reads || upper.starts_with("INSERT")) {
        booking_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(Self::actor(client), query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let mut responses = self.run(Self::actor(client), &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Replaced highest first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, calendars: Arc<SyncCache>, password: String, stale_sync_after: Ms) -> Self {
        let auth_source = SlotbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(engine, calendars, stale_sync_after)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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
pub async fn process_connection(socket: TcpStream, factory: Arc<SlotbookFactory>) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported for each engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotNotAvailable => "23P01",
        EngineError::InvalidBookingTime(_) => "22008",
        EngineError::BookingCancelled
        | EngineError::BookingAlreadyTerminal(_)
        | EngineError::InvalidTransition { .. }
        | EngineError::TemplateInactiveOrPrivate(_) => "55000",
        EngineError::HostOrTemplateNotFound(_) | EngineError::BookingNotFound => "P0002",
        EngineError::NotPermitted(_) => "42501",
        EngineError::InvalidInput(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
