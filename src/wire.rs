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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::PairbookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct PairbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<PairbookQueryParser>,
}

impl PairbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(PairbookQueryParser),
        }
    }

    /// Parse and run one statement, recording RED metrics for it.
    async fn run_sql(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::RegisterPerson { id, name } => {
                engine.register_person(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::ListPeople => {
                let schema = Arc::new(people_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_people()
                    .await
                    .into_iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.id.to_string())?;
                        encoder.encode_field(&p.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SetAvailability { person_id, start, end } => {
                engine
                    .set_availability(person_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::GetAvailability { person_id, start, end } => {
                let spans = engine
                    .get_availability(person_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let pid = person_id.to_string();
                let rows: Vec<PgWireResult<_>> = spans
                    .into_iter()
                    .map(|span| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&pid)?;
                        encoder.encode_field(&span.start)?;
                        encoder.encode_field(&span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::FindOverlap { person_a, person_b } => {
                let spans = engine
                    .find_overlap(person_a, person_b)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(overlap_schema());
                let rows: Vec<PgWireResult<_>> = spans
                    .into_iter()
                    .map(|span| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&span.start)?;
                        encoder.encode_field(&span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::ScheduleMeeting {
                person_a,
                person_b,
                start,
                end,
                returning,
            } => {
                let id = engine
                    .schedule_meeting(person_a, person_b, start, end)
                    .await
                    .map_err(engine_err)?;
                if !returning {
                    return Ok(Response::Execution(Tag::new("INSERT").with_rows(1)));
                }
                let schema = Arc::new(returning_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&id.to_string())?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::ListMeetings { person_id } => {
                let meetings = engine.get_meetings(person_id).map_err(engine_err)?;
                let schema = Arc::new(meetings_schema());
                let rows: Vec<PgWireResult<_>> = meetings
                    .into_iter()
                    .map(|m| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&m.id.to_string())?;
                        encoder.encode_field(&m.person_a.to_string())?;
                        encoder.encode_field(&m.person_b.to_string())?;
                        encoder.encode_field(&m.start)?;
                        encoder.encode_field(&m.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn people_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name")]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text_field("person_id"), int_field("start"), int_field("end")]
}

fn overlap_schema() -> Vec<FieldInfo> {
    vec![int_field("start"), int_field("end")]
}

fn meetings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("person_a"),
        text_field("person_b"),
        int_field("start"),
        int_field("end"),
    ]
}

fn returning_schema() -> Vec<FieldInfo> {
    vec![text_field("id")]
}

/// Row description for a statement that may still contain `$N` placeholders,
/// so it is derived from the statement shape rather than a full parse.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    match words.first() {
        Some(&"SELECT") => {
            let table = words
                .iter()
                .position(|w| *w == "FROM")
                .and_then(|i| words.get(i + 1))
                .map(|t| t.trim_matches('"'));
            match table {
                Some("PEOPLE") => people_schema(),
                Some("AVAILABILITY") => availability_schema(),
                Some("OVERLAP") => overlap_schema(),
                Some("MEETINGS") => meetings_schema(),
                _ => vec![],
            }
        }
        Some(&"INSERT") if words.contains(&"RETURNING") => returning_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for PairbookHandler {
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
        Ok(vec![self.run_sql(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct PairbookQueryParser;

#[async_trait]
impl QueryParser for PairbookQueryParser {
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
impl ExtendedQueryHandler for PairbookHandler {
    type Statement = String;
    type QueryParser = PairbookQueryParser;

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
        self.run_sql(&sql).await
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
/// `$N` placeholders outside quoted literals and identifiers, as
/// `(byte range of the token, N)`.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                // A doubled quote is an escaped quote, not the end.
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            _ => i += 1,
        }
    }
    found
}

fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass: each placeholder token is replaced exactly once,
/// so a `$1` inside a bound value is never expanded again.
fn substitute<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct PairbookFactory {
    handler: Arc<PairbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<PairbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl PairbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = PairbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(PairbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for PairbookFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = PairbookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::PersonNotFound(_) => "P0002",
        EngineError::InvalidTimestamp { .. } => "22007",
        EngineError::AlreadyAvailable { .. } | EngineError::AlreadyExists(_) => "23505",
        EngineError::NoAvailabilityOverlap { .. } => "23P01",
        EngineError::SamePerson(_) => "22023",
        EngineError::ConcurrencyConflict => "40001",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::StorageFailure(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use ulid::Ulid;

    fn names(schema: &[FieldInfo]) -> Vec<String> {
        schema.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn count_params_highest_index() {
        assert_eq!(count_params("SELECT * FROM people"), 0);
        assert_eq!(count_params("SELECT * FROM overlap WHERE person_a = $1 AND person_b = $2"), 2);
        assert_eq!(count_params("VALUES ($2, $1, $11)"), 11);
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let sql = "INSERT INTO people (id, name) VALUES ($1, $2)";
        let params = vec![Some(b"01ARZ3NDEKTSV4RRFFQ69G5FAV".to_vec()), Some(b"O'Brien".to_vec())];
        assert_eq!(
            substitute(sql, &params),
            "INSERT INTO people (id, name) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'O''Brien')"
        );
        let params: Vec<Option<Vec<u8>>> = vec![None];
        assert_eq!(substitute("SELECT $1", &params), "SELECT NULL");
    }

    #[test]
    fn substitute_does_not_clobber_two_digit_params() {
        let params: Vec<Option<Vec<u8>>> = (1..=10).map(|i| Some(i.to_string().into_bytes())).collect();
        assert_eq!(substitute("$1 $10", &params), "'1' '10'");
    }

    #[test]
    fn substituted_values_are_not_expanded_again() {
        let sql = "INSERT INTO people (id, name) VALUES ($2, $1)";
        let params = vec![Some(b"Costs $1".to_vec()), Some(b"01ARZ3NDEKTSV4RRFFQ69G5FAV".to_vec())];
        let substituted = substitute(sql, &params);
        assert_eq!(
            substituted,
            "INSERT INTO people (id, name) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'Costs $1')"
        );
        match crate::sql::parse_sql(&substituted).unwrap() {
            crate::sql::Command::RegisterPerson { name, .. } => assert_eq!(name, "Costs $1"),
            cmd => panic!("expected RegisterPerson, got {cmd:?}"),
        }
    }

    #[test]
    fn placeholders_inside_literals_are_left_alone() {
        let params = vec![Some(b"x".to_vec())];
        assert_eq!(substitute("SELECT '$1', \"$1\", $1", &params), "SELECT '$1', \"$1\", 'x'");
        assert_eq!(substitute("SELECT 'it''s $1', $1", &params), "SELECT 'it''s $1', 'x'");
        assert_eq!(count_params("SELECT '$3' WHERE a = $1"), 1);
        // Unbound indexes stay as written.
        assert_eq!(substitute("SELECT $1, $2", &params), "SELECT 'x', $2");
    }

    #[test]
    fn result_schema_by_table() {
        assert_eq!(names(&result_schema("SELECT * FROM people")), ["id", "name"]);
        assert_eq!(
            names(&result_schema("select * from availability where person_id = $1")),
            ["person_id", "start", "end"]
        );
        assert_eq!(
            names(&result_schema("SELECT * FROM overlap WHERE person_a = $1 AND person_b = $2")),
            ["start", "end"]
        );
        assert_eq!(
            names(&result_schema("SELECT * FROM meetings WHERE person_id = $1;")),
            ["id", "person_a", "person_b", "start", "end"]
        );
        assert_eq!(
            names(&result_schema(
                r#"INSERT INTO meetings (person_a, person_b, start, "end") VALUES ($1, $2, $3, $4) RETURNING id"#
            )),
            ["id"]
        );
        assert!(result_schema(r#"INSERT INTO availability (person_id, start, "end") VALUES ($1, $2, $3)"#).is_empty());
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let id = Ulid::new();
        let span = Span::new(0, 10);
        let cases = [
            (EngineError::PersonNotFound(id), "P0002"),
            (EngineError::InvalidTimestamp { start: 5, end: 1, now: 0 }, "22007"),
            (EngineError::AlreadyExists(id), "23505"),
            (EngineError::AlreadyAvailable { person_id: id, existing: span }, "23505"),
            (EngineError::NoAvailabilityOverlap { person_id: id, span }, "23P01"),
            (EngineError::SamePerson(id), "22023"),
            (EngineError::ConcurrencyConflict, "40001"),
            (EngineError::LimitExceeded("x"), "54000"),
            (EngineError::StorageFailure("disk".into()), "58030"),
        ];
        for (err, code) in cases {
            assert_eq!(sqlstate(&err), code, "{err}");
        }
    }
}
