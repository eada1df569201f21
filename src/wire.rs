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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::error;

use crate::auth::CarbookAuthSource;
use crate::catalog::Catalog;
use crate::engine::EngineError;
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::report::{CarPerformance, MonthlySummary, SalesSummary};
use crate::services::Services;
use crate::sql::{self, CarQuery, Command};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    services: Arc<Services>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = CarbookFactory::new(services, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct CarbookHandler {
    services: Arc<Services>,
    query_parser: Arc<CarbookQueryParser>,
}

impl CarbookHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            query_parser: Arc::new(CarbookQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error").increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.services.engine;
        let fleet = &self.services.fleet;
        match cmd {
            Command::InsertCar { car, returning } => {
                let car = fleet.register(car).await.map_err(engine_err)?;
                Ok(car_result("INSERT", vec![car], returning))
            }
            Command::UpdateCar { id, changes, returning } => {
                let car = fleet.update(id, changes).await.map_err(engine_err)?;
                Ok(car_result("UPDATE", vec![car], returning))
            }
            Command::InsertReservation { request, returning } => {
                let r = engine.create_reservation(request).await.map_err(engine_err)?;
                Ok(reservation_result("INSERT", vec![r], returning))
            }
            Command::UpdateReservationStatus { id, status, returning } => {
                let r = engine.change_status(id, status).await.map_err(engine_err)?;
                Ok(reservation_result("UPDATE", vec![r], returning))
            }
            Command::CancelReservation { id, returning } => {
                let r = engine.cancel_reservation(id).await.map_err(engine_err)?;
                Ok(reservation_result("DELETE", vec![r], returning))
            }
            Command::SelectCars(query) => Ok(car_rows(&self.select_cars(&query))),
            Command::SelectReservations(filter) => {
                let found = engine.list_reservations(&filter).await;
                Ok(reservation_rows(&found))
            }
            Command::SelectAvailableCars { start, end } => {
                let cars = engine.available_cars(start, end).await.map_err(engine_err)?;
                Ok(car_rows(&cars))
            }
            Command::SelectQuote { car_id, start, end } => {
                let total = engine.quote(&car_id, start, end).map_err(engine_err)?;
                let car = fleet
                    .get(&car_id)
                    .ok_or_else(|| engine_err(EngineError::CarNotFound(car_id)))?;
                let window = DateWindow::new(start, end);
                let schema = Arc::new(quote_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&car_id.to_string())?;
                encoder.encode_field(&start.to_string())?;
                encoder.encode_field(&end.to_string())?;
                encoder.encode_field(&window.billable_days())?;
                encoder.encode_field(&car.daily_rate.to_string())?;
                encoder.encode_field(&total.to_string())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSalesSummary { from, to } => {
                let summary = engine.sales_summary(from, to).await.map_err(engine_err)?;
                Ok(sales_summary_rows(&summary))
            }
            Command::SelectMonthlySummary { from, to } => {
                let months = engine.monthly_summary(from, to).await.map_err(engine_err)?;
                Ok(monthly_summary_rows(&months))
            }
            Command::SelectCarPerformance { from, to } => {
                let cars = engine.car_performance(from, to).await.map_err(engine_err)?;
                Ok(car_performance_rows(&cars))
            }
        }
    }

    fn select_cars(&self, query: &CarQuery) -> Vec<Car> {
        let fleet = &self.services.fleet;
        let mut cars = match (&query.search, query.status) {
            (Some(text), _) => fleet.search(text),
            (None, Some(status)) => fleet.list_by_status(status),
            (None, None) => fleet.list(),
        };
        cars.retain(|c| query.id.is_none_or(|id| c.id == id) && query.status.is_none_or(|s| c.status == s));
        cars
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn car_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("make", Type::VARCHAR),
        field("model", Type::VARCHAR),
        field("year", Type::INT4),
        field("color", Type::VARCHAR),
        field("license_plate", Type::VARCHAR),
        field("daily_rate", Type::NUMERIC),
        field("status", Type::VARCHAR),
        field("location", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("created_at", Type::TIMESTAMPTZ),
        field("updated_at", Type::TIMESTAMPTZ),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("car_id", Type::VARCHAR),
        field("customer_name", Type::VARCHAR),
        field("customer_email", Type::VARCHAR),
        field("customer_phone", Type::VARCHAR),
        field("start_date", Type::DATE),
        field("end_date", Type::DATE),
        field("total_amount", Type::NUMERIC),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("created_at", Type::TIMESTAMPTZ),
        field("updated_at", Type::TIMESTAMPTZ),
    ]
}

fn quote_schema() -> Vec<FieldInfo> {
    vec![
        field("car_id", Type::VARCHAR),
        field("start_date", Type::DATE),
        field("end_date", Type::DATE),
        field("days", Type::INT8),
        field("daily_rate", Type::NUMERIC),
        field("total_amount", Type::NUMERIC),
    ]
}

fn sales_summary_schema() -> Vec<FieldInfo> {
    vec![
        field("from_date", Type::DATE),
        field("to_date", Type::DATE),
        field("total_reservations", Type::INT8),
        field("total_revenue", Type::NUMERIC),
        field("average_booking_value", Type::NUMERIC),
        field("total_rental_days", Type::INT8),
        field("most_popular_car", Type::VARCHAR),
        field("top_customer", Type::VARCHAR),
    ]
}

fn monthly_summary_schema() -> Vec<FieldInfo> {
    vec![
        field("year", Type::INT4),
        field("month", Type::INT4),
        field("reservations", Type::INT8),
        field("revenue", Type::NUMERIC),
    ]
}

fn car_performance_schema() -> Vec<FieldInfo> {
    vec![
        field("car_id", Type::VARCHAR),
        field("car_name", Type::VARCHAR),
        field("reservations", Type::INT8),
        field("revenue", Type::NUMERIC),
        field("average_booking_value", Type::NUMERIC),
        field("rental_days", Type::INT8),
    ]
}

/// Encode `items` one row each against `schema`.
fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
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

fn car_rows(cars: &[Car]) -> Response {
    rows_response(car_schema(), cars, |enc, car| {
        enc.encode_field(&car.id.to_string())?;
        enc.encode_field(&car.make)?;
        enc.encode_field(&car.model)?;
        enc.encode_field(&car.year)?;
        enc.encode_field(&car.color)?;
        enc.encode_field(&car.license_plate)?;
        enc.encode_field(&car.daily_rate.to_string())?;
        enc.encode_field(&car.status.as_str())?;
        enc.encode_field(&car.location)?;
        enc.encode_field(&car.description)?;
        enc.encode_field(&car.created_at.to_rfc3339())?;
        enc.encode_field(&car.updated_at.to_rfc3339())
    })
}

fn reservation_rows(reservations: &[Reservation]) -> Response {
    rows_response(reservation_schema(), reservations, |enc, r| {
        enc.encode_field(&r.id.to_string())?;
        enc.encode_field(&r.car_id.to_string())?;
        enc.encode_field(&r.customer.name)?;
        enc.encode_field(&r.customer.email)?;
        enc.encode_field(&r.customer.phone)?;
        enc.encode_field(&r.window.start.to_string())?;
        enc.encode_field(&r.window.end.to_string())?;
        enc.encode_field(&r.total_amount.to_string())?;
        enc.encode_field(&r.status.as_str())?;
        enc.encode_field(&r.notes)?;
        enc.encode_field(&r.created_at.to_rfc3339())?;
        enc.encode_field(&r.updated_at.to_rfc3339())
    })
}

fn sales_summary_rows(s: &SalesSummary) -> Response {
    rows_response(sales_summary_schema(), std::slice::from_ref(s), |enc, s| {
        enc.encode_field(&s.from.to_string())?;
        enc.encode_field(&s.to.to_string())?;
        enc.encode_field(&(s.total_reservations as i64))?;
        enc.encode_field(&s.total_revenue.to_string())?;
        enc.encode_field(&s.average_booking_value.to_string())?;
        enc.encode_field(&s.total_rental_days)?;
        enc.encode_field(&s.most_popular_car.map(|id| id.to_string()))?;
        enc.encode_field(&s.top_customer)
    })
}

fn monthly_summary_rows(months: &[MonthlySummary]) -> Response {
    rows_response(monthly_summary_schema(), months, |enc, m| {
        enc.encode_field(&m.year)?;
        enc.encode_field(&(m.month as i32))?;
        enc.encode_field(&(m.reservations as i64))?;
        enc.encode_field(&m.revenue.to_string())
    })
}

fn car_performance_rows(cars: &[CarPerformance]) -> Response {
    rows_response(car_performance_schema(), cars, |enc, c| {
        enc.encode_field(&c.car_id.to_string())?;
        enc.encode_field(&c.car_name)?;
        enc.encode_field(&(c.reservations as i64))?;
        enc.encode_field(&c.revenue.to_string())?;
        enc.encode_field(&c.average_booking_value.to_string())?;
        enc.encode_field(&c.rental_days)
    })
}

/// Command tag alone, or the written rows when the statement asked for RETURNING.
fn car_result(verb: &str, cars: Vec<Car>, returning: bool) -> Response {
    if returning {
        car_rows(&cars)
    } else {
        Response::Execution(Tag::new(verb).with_rows(cars.len()))
    }
}

fn reservation_result(verb: &str, reservations: Vec<Reservation>, returning: bool) -> Response {
    if returning {
        reservation_rows(&reservations)
    } else {
        Response::Execution(Tag::new(verb).with_rows(reservations.len()))
    }
}

/// Result columns for a statement, judged from its target table without
/// executing it. Empty for statements that only return a command tag.
fn describe_sql(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1).copied())
    };

    let table = match words.first().copied() {
        Some("select") => after("from"),
        Some("insert") => after("into").filter(|_| words.contains(&"returning")),
        Some("update") => after("update").filter(|_| words.contains(&"returning")),
        Some("delete") => after("from").filter(|_| words.contains(&"returning")),
        _ => None,
    };
    match table {
        Some("cars") | Some("available_cars") => car_schema(),
        Some("reservations") => reservation_schema(),
        Some("quote") => quote_schema(),
        Some("sales_summary") => sales_summary_schema(),
        Some("monthly_summary") => monthly_summary_schema(),
        Some("car_performance") => car_performance_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CarbookHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CarbookQueryParser;

#[async_trait]
impl QueryParser for CarbookQueryParser {
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
        Ok(describe_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CarbookHandler {
    type Statement = String;
    type QueryParser = CarbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        self.run(&sql).await
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
        Ok(DescribeStatementResponse::new(param_types, describe_sql(&target.statement)))
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
        Ok(DescribePortalResponse::new(describe_sql(&target.statement.statement)))
    }
}

/// Byte range and index of every `$N` placeholder outside quoted literals.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // '' inside a literal toggles twice, which leaves us inside it
            b'\'' => in_quote = !in_quote,
            b'$' if !in_quote => {
                let digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
                if let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() {
                    found.push((i..i + 1 + digits, n));
                    i += digits;
                }
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Splice bound values (text format) into the statement in one pass over
/// the original text. Inserted values are never scanned again, so a value
/// containing `$1` stays literal.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[last..range.start]);
        match param {
            Some(value) => {
                out.push('\'');
                out.push_str(&value.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CarbookFactory {
    handler: Arc<CarbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<CarbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CarbookFactory {
    pub fn new(services: Arc<Services>, password: String) -> Self {
        let auth_source = CarbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CarbookHandler::new(services)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CarbookFactory {
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

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine outcome, so clients can branch without parsing messages.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidWindow { .. } | EngineError::Validation(_) | EngineError::LimitExceeded(_) => "22023",
        EngineError::CarNotFound(_) | EngineError::NotFound(_) => "P0002",
        EngineError::CarUnavailable(_) | EngineError::InvalidTransition { .. } => "55000",
        EngineError::SchedulingConflict { .. } => "23P01",
        EngineError::StaleState { .. } => "40001",
        EngineError::DuplicateLicensePlate(_) => "23505",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if !e.is_client_error() {
        error!("{e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), sqlstate(&e).into(), e.to_string())))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), "42601".into(), e.to_string())))
}
