use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::TableBookAuthSource;
use crate::engine::{Engine, EngineError, UserBooking};
use crate::model::*;
use crate::observability::{self, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, VisitAction};

pub struct TableBookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<TableBookQueryParser>,
}

impl TableBookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(TableBookQueryParser),
        }
    }

    /// Execute one command and record its metrics.
    async fn run(&self, actor: Option<Ulid>, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: Option<Ulid>, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRestaurant {
                id,
                owner_id,
                name,
                settings,
            } => {
                if require_actor(actor)? != owner_id {
                    return Err(engine_err(EngineError::AccessDenied));
                }
                engine
                    .register_restaurant(id, owner_id, name, settings)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdateSettings {
                restaurant_id,
                settings,
            } => {
                engine
                    .update_settings(restaurant_id, require_actor(actor)?, settings)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::VerifyRestaurant { restaurant_id } => {
                engine
                    .verify_restaurant(restaurant_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteRestaurant { id } => {
                engine
                    .archive_restaurant(id, require_actor(actor)?)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertTable {
                restaurant_id,
                table_id,
                capacity,
            } => {
                engine
                    .add_table(restaurant_id, require_actor(actor)?, table_id, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::UpdateTableCapacity {
                restaurant_id,
                table_id,
                capacity,
            } => {
                engine
                    .update_table_capacity(restaurant_id, require_actor(actor)?, table_id, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteTable {
                restaurant_id,
                table_id,
            } => {
                engine
                    .remove_table(restaurant_id, require_actor(actor)?, table_id)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertEmployee {
                restaurant_id,
                user_id,
                hall_access,
            } => {
                engine
                    .hire_employee(restaurant_id, require_actor(actor)?, user_id, hall_access)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::SetOnDuty {
                restaurant_id,
                user_id,
                on_duty,
            } => {
                engine
                    .set_on_duty(restaurant_id, require_actor(actor)?, user_id, on_duty)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteEmployee {
                restaurant_id,
                user_id,
            } => {
                engine
                    .fire_employee(restaurant_id, require_actor(actor)?, user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertReservation {
                id,
                restaurant_id,
                party_size,
                start,
                end,
                takeaway,
            } => {
                let request = ReservationRequest {
                    id,
                    restaurant_id,
                    party_size,
                    window: Span { start, end },
                    takeaway,
                };
                engine
                    .create_reservation(request, require_actor(actor)?)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertWalkIn {
                id,
                restaurant_id,
                party_size,
                table_id,
                takeaway,
            } => {
                let request = WalkInRequest {
                    id,
                    restaurant_id,
                    party_size,
                    table_id,
                    takeaway,
                };
                engine
                    .create_walk_in(request, require_actor(actor)?)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::TransitionVisit { visit_id, action } => {
                let actor = require_actor(actor)?;
                let result = match action {
                    VisitAction::Approve => engine.decide_reservation(visit_id, actor, true).await,
                    VisitAction::Decline => engine.decide_reservation(visit_id, actor, false).await,
                    VisitAction::Start => engine.start_visit(visit_id, actor).await,
                    VisitAction::End => engine.end_visit(visit_id, actor).await,
                };
                result.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::ReassignTable { visit_id, table_id } => {
                engine
                    .reassign_table(visit_id, table_id, require_actor(actor)?)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::CancelVisit { id } => {
                engine
                    .cancel_visit(id, require_actor(actor)?)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectAvailableTables {
                restaurant_id,
                party_size,
                start,
                end,
            } => {
                let tables = engine
                    .list_available_tables(restaurant_id, party_size, Span { start, end })
                    .await
                    .map_err(engine_err)?;
                Ok(table_rows(tables))
            }
            Command::SelectRestaurants => {
                let restaurants = engine.list_restaurants().await;
                Ok(rows_response(restaurants_schema(), restaurants, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.owner_id.to_string())?;
                    enc.encode_field(&r.name)?;
                    enc.encode_field(&i64::from(r.settings.max_reservation_minutes))?;
                    enc.encode_field(&r.settings.reservation_deposit.and_then(|d| i64::try_from(d).ok()))?;
                    enc.encode_field(&r.active)
                }))
            }
            Command::SelectTables { restaurant_id } => {
                let tables = engine.list_tables(restaurant_id).await.map_err(engine_err)?;
                Ok(table_rows(tables))
            }
            Command::SelectVisits {
                restaurant_id,
                start,
                end,
            } => {
                let window = Span {
                    start: start.unwrap_or(Ms::MIN),
                    end: end.unwrap_or(Ms::MAX),
                };
                let filter = (start.is_some() || end.is_some()).then_some(window);
                let visits = engine
                    .list_visits(restaurant_id, filter)
                    .await
                    .map_err(engine_err)?;
                Ok(visit_rows(visits))
            }
            Command::SelectVisit { id } => {
                let visit = engine.get_visit(id).await.map_err(engine_err)?;
                Ok(visit_rows(vec![visit]))
            }
            Command::SelectUserReservations { user_id } => {
                if require_actor(actor)? != user_id {
                    return Err(engine_err(EngineError::AccessDenied));
                }
                let held = engine.list_user_reservations(&user_id);
                Ok(rows_response(user_reservations_schema(), held, |enc, b: &UserBooking| {
                    enc.encode_field(&b.visit_id.to_string())?;
                    enc.encode_field(&b.restaurant_id.to_string())?;
                    enc.encode_field(&b.span.start)?;
                    enc.encode_field(&b.span.end)
                }))
            }
        }
    }
}

/// The connection's user name is the acting user's ULID.
fn actor_id<C: ClientInfo>(client: &C) -> Option<Ulid> {
    client
        .metadata()
        .get("user")
        .and_then(|user| Ulid::from_string(user).ok())
}

fn require_actor(actor: Option<Ulid>) -> PgWireResult<Ulid> {
    actor.ok_or_else(|| {
        metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "28000".into(),
            "connection user name must be a ULID to modify data".into(),
        )))
    })
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

// ── Result sets ──────────────────────────────────────────────────

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn tables_schema() -> Vec<FieldInfo> {
    vec![varchar("restaurant_id"), int8("table_id"), int8("capacity")]
}

fn visits_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("restaurant_id"),
        int8("table_id"),
        varchar("creator_id"),
        int8("party_size"),
        boolean("takeaway"),
        int8("start"),
        int8("end"),
        int8("deposit"),
        varchar("status"),
    ]
}

fn restaurants_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("owner_id"),
        varchar("name"),
        int8("max_reservation_minutes"),
        int8("deposit"),
        boolean("active"),
    ]
}

fn user_reservations_schema() -> Vec<FieldInfo> {
    vec![
        varchar("visit_id"),
        varchar("restaurant_id"),
        int8("start"),
        int8("end"),
    ]
}

/// Result columns for a statement, judged from the relation it selects from.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    if lower.contains("available_tables") {
        tables_schema()
    } else if lower.contains("user_reservations") {
        user_reservations_schema()
    } else if lower.contains("restaurants") {
        restaurants_schema()
    } else if lower.contains("tables") {
        tables_schema()
    } else if lower.contains("visits") {
        visits_schema()
    } else {
        vec![]
    }
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn table_rows(tables: Vec<TableInfo>) -> Response {
    rows_response(tables_schema(), tables, |enc, t| {
        enc.encode_field(&t.restaurant_id.to_string())?;
        enc.encode_field(&i64::from(t.table_id))?;
        enc.encode_field(&i64::from(t.capacity))
    })
}

fn visit_rows(visits: Vec<VisitInfo>) -> Response {
    rows_response(visits_schema(), visits, |enc, v| {
        enc.encode_field(&v.id.to_string())?;
        enc.encode_field(&v.restaurant_id.to_string())?;
        enc.encode_field(&v.table_id.map(i64::from))?;
        enc.encode_field(&v.creator_id.to_string())?;
        enc.encode_field(&i64::from(v.party_size))?;
        enc.encode_field(&v.takeaway)?;
        enc.encode_field(&v.start)?;
        enc.encode_field(&v.end)?;
        enc.encode_field(&v.deposit.and_then(|d| i64::try_from(d).ok()))?;
        enc.encode_field(&v.status.to_string())
    })
}

#[async_trait]
impl SimpleQueryHandler for TableBookHandler {
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
        let actor = actor_id(client);
        let cmds = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            responses.push(self.run(actor, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TableBookQueryParser;

#[async_trait]
impl QueryParser for TableBookQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TableBookHandler {
    type Statement = String;
    type QueryParser = TableBookQueryParser;

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
        let actor = actor_id(client);
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(actor, cmd).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
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
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TableBookFactory {
    handler: Arc<TableBookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<TableBookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl TableBookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = TableBookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TableBookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TableBookFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = TableBookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
