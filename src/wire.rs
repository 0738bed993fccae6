use std::fmt::Debug;
use std::future::Future;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::ClashdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS, WRITE_RETRIES_TOTAL};
use crate::sql::{self, Command};
use crate::time::format_ms;

pub struct ClashdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<ClashdQueryParser>,
}

impl ClashdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(ClashdQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine: &Engine = &self.engine;
        match cmd {
            Command::InsertResource { name, kind } => {
                let resource = engine.create_resource(&name, &kind).await.map_err(engine_err)?;
                Ok(vec![id_response(resource.id)?])
            }
            Command::UpdateResource { id, name, kind } => {
                engine.patch_resource(id, name, kind).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertEvent { draft } => {
                let event = retry_once(move || engine.create_event(draft.clone()))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![id_response(event.id)?])
            }
            Command::UpdateEvent { id, changes } => {
                retry_once(move || engine.patch_event(id, changes.clone()))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteEvent { id } => {
                engine.delete_event(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectResources => {
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_resources()
                    .await
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(r.id as i64))?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&r.kind)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectEvents => {
                let schema = Arc::new(events_schema());
                let mut rows: Vec<PgWireResult<_>> = Vec::new();
                for event in engine.list_events().await {
                    // Deleted between listing and lookup: skip.
                    let Ok(resource_ids) = engine.event_resource_ids(event.id).await else {
                        continue;
                    };
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&(event.id as i64))?;
                    encoder.encode_field(&event.title)?;
                    encoder.encode_field(&format_ms(event.span.start))?;
                    encoder.encode_field(&format_ms(event.span.end))?;
                    encoder.encode_field(&event.description)?;
                    encoder.encode_field(&join_ids(&resource_ids))?;
                    rows.push(Ok(encoder.take_row()));
                }
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAllocations { filter } => {
                let schema = Arc::new(allocations_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_allocations(filter)
                    .into_iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&(a.event_id as i64))?;
                        encoder.encode_field(&(a.resource_id as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectConflictCheck {
                start,
                end,
                resource_ids,
                exclude_event_id,
            } => {
                let conflicts = engine
                    .check_conflicts(start, end, &resource_ids, exclude_event_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(conflict_check_schema());
                let rows: Vec<PgWireResult<_>> = conflicts
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(c.event.id as i64))?;
                        encoder.encode_field(&c.event.title)?;
                        encoder.encode_field(&format_ms(c.event.span.start))?;
                        encoder.encode_field(&format_ms(c.event.span.end))?;
                        encoder.encode_field(&(c.resource.id as i64))?;
                        encoder.encode_field(&c.resource.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectConflicts => {
                let pairs = engine.find_all_conflicts().await.map_err(engine_err)?;
                let schema = Arc::new(conflicts_schema());
                let rows: Vec<PgWireResult<_>> = pairs
                    .into_iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(p.resource.id as i64))?;
                        encoder.encode_field(&p.resource.name)?;
                        for event in [&p.event_a, &p.event_b] {
                            encoder.encode_field(&(event.id as i64))?;
                            encoder.encode_field(&event.title)?;
                            encoder.encode_field(&format_ms(event.span.start))?;
                            encoder.encode_field(&format_ms(event.span.end))?;
                        }
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectUtilization { start, end, now } => {
                let report = engine
                    .utilization_report(start, end, now)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(utilization_schema());
                let rows: Vec<PgWireResult<_>> = report
                    .into_iter()
                    .map(|row| {
                        let upcoming: Vec<EventId> = row.upcoming.iter().map(|e| e.id).collect();
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(row.resource.id as i64))?;
                        encoder.encode_field(&row.resource.name)?;
                        encoder.encode_field(&row.resource.kind)?;
                        encoder.encode_field(&row.total_hours)?;
                        encoder.encode_field(&join_ids(&upcoming))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
        }
    }
}

/// Run a write, repeating it once if a resource it touched was deleted mid-flight.
async fn retry_once<T, F, Fut>(mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    match op().await {
        Err(EngineError::ConcurrencyConflict(resource_id)) => {
            debug!(resource_id, "retrying write after concurrent resource change");
            metrics::counter!(WRITE_RETRIES_TOTAL).increment(1);
            op().await
        }
        other => other,
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn id_response(id: u64) -> PgWireResult<Response> {
    let schema = Arc::new(id_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&(id as i64))?;
    Ok(query_response(schema, vec![Ok(encoder.take_row())]))
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter().map(u64::to_string).collect::<Vec<_>>().join(",")
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn id_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::INT8)]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("name", Type::VARCHAR),
        field("kind", Type::VARCHAR),
    ]
}

fn events_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("title", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("resources", Type::VARCHAR),
    ]
}

fn allocations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("event_id", Type::INT8),
        field("resource_id", Type::INT8),
    ]
}

fn conflict_check_schema() -> Vec<FieldInfo> {
    vec![
        field("event_id", Type::INT8),
        field("title", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("resource_id", Type::INT8),
        field("resource_name", Type::VARCHAR),
    ]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::INT8),
        field("resource_name", Type::VARCHAR),
        field("event_a_id", Type::INT8),
        field("event_a_title", Type::VARCHAR),
        field("event_a_start", Type::VARCHAR),
        field("event_a_end", Type::VARCHAR),
        field("event_b_id", Type::INT8),
        field("event_b_title", Type::VARCHAR),
        field("event_b_start", Type::VARCHAR),
        field("event_b_end", Type::VARCHAR),
    ]
}

fn utilization_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::INT8),
        field("resource_name", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("total_hours", Type::FLOAT8),
        field("upcoming", Type::VARCHAR),
    ]
}

/// Result columns a statement will produce, judged from its text alone
/// (parameters may still be unbound).
fn describe_schema(sql: &str) -> Vec<FieldInfo> {
    let normalized = sql.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.starts_with("insert") {
        return if normalized.contains("into resources") || normalized.contains("into events") {
            id_schema()
        } else {
            vec![]
        };
    }
    if !normalized.starts_with("select") {
        return vec![];
    }
    let table = normalized
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split([' ', ';']).next())
        .map(|t| t.trim_matches('"'))
        .unwrap_or_default();
    match table {
        "resources" => resources_schema(),
        "events" => events_schema(),
        "allocations" => allocations_schema(),
        "conflict_check" => conflict_check_schema(),
        "conflicts" => conflicts_schema(),
        "utilization" => utilization_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ClashdHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ClashdQueryParser;

#[async_trait]
impl QueryParser for ClashdQueryParser {
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
impl ExtendedQueryHandler for ClashdHandler {
    type Statement = String;
    type QueryParser = ClashdQueryParser;

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
        let mut responses = self.run(&sql).await?;
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

pub struct ClashdFactory {
    handler: Arc<ClashdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ClashdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ClashdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = ClashdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ClashdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ClashdFactory {
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
    let factory = Arc::new(ClashdFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        // exclusion_violation
        EngineError::Conflict(_) => "23P01",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_highest_index() {
        assert_eq!(count_params("SELECT * FROM events"), 0);
        assert_eq!(count_params("DELETE FROM events WHERE id = $1"), 1);
        assert_eq!(count_params("UPDATE events SET title = $2 WHERE id = $10"), 10);
        assert_eq!(count_params("SELECT '$' FROM resources"), 0);
    }

    #[test]
    fn describe_by_table() {
        let names = |sql: &str| -> Vec<String> {
            describe_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("SELECT * FROM resources"), vec!["id", "name", "kind"]);
        assert_eq!(names("select *\n  from conflict_check where resources = $1")[0], "event_id");
        assert_eq!(names("SELECT * FROM conflicts;").len(), 10);
        assert_eq!(names("SELECT * FROM utilization WHERE start >= $1")[3], "total_hours");
        assert_eq!(names("INSERT INTO events (title) VALUES ($1)"), vec!["id"]);
        assert!(names("DELETE FROM events WHERE id = $1").is_empty());
        assert!(names("SELECT * FROM nowhere").is_empty());
    }

    #[test]
    fn conflicts_map_to_exclusion_violation() {
        assert_eq!(sqlstate(&EngineError::Conflict(vec![])), "23P01");
        assert_eq!(sqlstate(&EngineError::EventNotFound(1)), "P0001");
        assert_eq!(sqlstate(&EngineError::ConcurrencyConflict(2)), "P0001");
    }

    #[test]
    fn join_ids_comma_separated() {
        assert_eq!(join_ids(&[3, 1, 2]), "3,1,2");
        assert_eq!(join_ids(&[]), "");
    }

    #[tokio::test]
    async fn retry_once_repeats_only_concurrency_conflicts() {
        let mut calls = 0;
        let result: Result<u32, EngineError> = retry_once(|| {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt == 1 {
                    Err(EngineError::ConcurrencyConflict(4))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);

        let mut calls = 0;
        let result: Result<u32, EngineError> = retry_once(|| {
            calls += 1;
            async { Err(EngineError::InvalidInput("nope")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
