use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterPerson {
        id: Ulid,
        name: String,
    },
    ListPeople,
    SetAvailability {
        person_id: Ulid,
        start: Secs,
        end: Secs,
    },
    GetAvailability {
        person_id: Ulid,
        start: Option<Secs>,
        end: Option<Secs>,
    },
    FindOverlap {
        person_a: Ulid,
        person_b: Ulid,
    },
    ScheduleMeeting {
        person_a: Ulid,
        person_b: Ulid,
        start: Secs,
        end: Secs,
        /// `RETURNING id` was given.
        returning: bool,
    },
    ListMeetings {
        person_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("more than one statement".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "people" => {
            let values = values_by_column(insert, "people", &["id", "name"])?;
            Ok(Command::RegisterPerson {
                id: parse_ulid_expr(&values[0])?,
                name: parse_string_expr(&values[1])?,
            })
        }
        "availability" => {
            let values = values_by_column(insert, "availability", &["person_id", "start", "end"])?;
            Ok(Command::SetAvailability {
                person_id: parse_ulid_expr(&values[0])?,
                start: parse_i64_expr(&values[1])?,
                end: parse_i64_expr(&values[2])?,
            })
        }
        "meetings" => {
            let values =
                values_by_column(insert, "meetings", &["person_a", "person_b", "start", "end"])?;
            Ok(Command::ScheduleMeeting {
                person_a: parse_ulid_expr(&values[0])?,
                person_b: parse_ulid_expr(&values[1])?,
                start: parse_i64_expr(&values[2])?,
                end: parse_i64_expr(&values[3])?,
                returning: returns_id(insert)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// The single VALUES row rearranged into `expected` column order. Without a
/// column list the row is taken positionally.
fn values_by_column(
    insert: &ast::Insert,
    table: &'static str,
    expected: &[&str],
) -> Result<Vec<Expr>, SqlError> {
    let values = extract_insert_values(insert)?;
    if insert.columns.is_empty() {
        if values.len() != expected.len() {
            return Err(SqlError::WrongArity(table, expected.len(), values.len()));
        }
        return Ok(values);
    }

    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if columns.len() != values.len() {
        return Err(SqlError::Parse(format!(
            "{table}: {} columns but {} values",
            columns.len(),
            values.len()
        )));
    }
    if let Some(extra) = columns.iter().find(|c| !expected.contains(&c.as_str())) {
        return Err(SqlError::Unsupported(format!("column {extra} in {table}")));
    }
    if columns.len() != expected.len() {
        return Err(SqlError::WrongArity(table, expected.len(), values.len()));
    }

    expected
        .iter()
        .map(|col| {
            columns
                .iter()
                .position(|c| c.as_str() == *col)
                .map(|i| values[i].clone())
                .ok_or_else(|| SqlError::Parse(format!("{table}: column {col} given twice")))
        })
        .collect()
}

/// Only `RETURNING id` (or `RETURNING *`) is understood.
fn returns_id(insert: &ast::Insert) -> Result<bool, SqlError> {
    let Some(items) = &insert.returning else {
        return Ok(false);
    };
    for item in items {
        match item {
            ast::SelectItem::Wildcard(_) => {}
            ast::SelectItem::UnnamedExpr(expr) if expr_column_name(expr).as_deref() == Some("id") => {}
            other => return Err(SqlError::Unsupported(format!("RETURNING {other}"))),
        }
    }
    Ok(true)
}

/// Column equality and range filters collected from a WHERE clause.
#[derive(Default)]
struct Filters {
    person_id: Option<Ulid>,
    person_a: Option<Ulid>,
    person_b: Option<Ulid>,
    start: Option<Secs>,
    end: Option<Secs>,
}

impl Filters {
    /// Reject any filter on a column `table` cannot be filtered by.
    fn only(&self, table: &str, allowed: &[&str]) -> Result<(), SqlError> {
        let present = [
            ("person_id", self.person_id.is_some()),
            ("person_a", self.person_a.is_some()),
            ("person_b", self.person_b.is_some()),
            ("start", self.start.is_some()),
            ("end", self.end.is_some()),
        ];
        match present.iter().find(|(col, set)| *set && !allowed.contains(col)) {
            Some((col, _)) => Err(SqlError::Unsupported(format!("filter on {col} for {table}"))),
            None => Ok(()),
        }
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

    let allowed: &[&str] = match table.as_str() {
        "people" => &[],
        "availability" => &["person_id", "start", "end"],
        "overlap" => &["person_a", "person_b"],
        "meetings" => &["person_id"],
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }
    filters.only(&table, allowed)?;

    match table.as_str() {
        "availability" => Ok(Command::GetAvailability {
            person_id: filters.person_id.ok_or(SqlError::MissingFilter("person_id"))?,
            start: filters.start,
            end: filters.end,
        }),
        "overlap" => Ok(Command::FindOverlap {
            person_a: filters.person_a.ok_or(SqlError::MissingFilter("person_a"))?,
            person_b: filters.person_b.ok_or(SqlError::MissingFilter("person_b"))?,
        }),
        "meetings" => Ok(Command::ListMeetings {
            person_id: filters.person_id.ok_or(SqlError::MissingFilter("person_id"))?,
        }),
        _ => Ok(Command::ListPeople),
    }
}

/// Only `AND`-joined `person_id = ..`, `person_a = ..`, `person_b = ..`,
/// `start >= ..` and `"end" <= ..` are understood.
fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    use ast::BinaryOperator as Op;

    let (left, op, right) = match expr {
        Expr::Nested(inner) => return extract_filters(inner, filters),
        Expr::BinaryOp { left, op: Op::And, right } => {
            extract_filters(left, filters)?;
            return extract_filters(right, filters);
        }
        Expr::BinaryOp { left, op, right } => (left, op, right),
        other => return Err(SqlError::Unsupported(format!("WHERE {other}"))),
    };

    match (expr_column_name(left).as_deref(), op) {
        (Some("person_id"), Op::Eq) => set_once(&mut filters.person_id, parse_ulid_expr(right)?, "person_id"),
        (Some("person_a"), Op::Eq) => set_once(&mut filters.person_a, parse_ulid_expr(right)?, "person_a"),
        (Some("person_b"), Op::Eq) => set_once(&mut filters.person_b, parse_ulid_expr(right)?, "person_b"),
        (Some("start"), Op::GtEq) => set_once(&mut filters.start, parse_i64_expr(right)?, "start"),
        (Some("end"), Op::LtEq) => set_once(&mut filters.end, parse_i64_expr(right)?, "end"),
        _ => Err(SqlError::Unsupported(format!("WHERE {expr}"))),
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, column: &str) -> Result<(), SqlError> {
    if slot.is_some() {
        return Err(SqlError::Unsupported(format!("repeated filter on {column}")));
    }
    *slot = Some(value);
    Ok(())
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_person() {
        let sql = format!("INSERT INTO people (id, name) VALUES ('{A}', 'Ada Lovelace')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::RegisterPerson {
                id: ulid(A),
                name: "Ada Lovelace".into(),
            }
        );
    }

    #[test]
    fn parse_insert_person_missing_name() {
        let sql = format!("INSERT INTO people (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("people", 2, 1))));
    }

    #[test]
    fn parse_select_people() {
        assert_eq!(parse_sql("SELECT * FROM people").unwrap(), Command::ListPeople);
    }

    #[test]
    fn parse_insert_availability() {
        let sql = format!(r#"INSERT INTO availability (person_id, start, "end") VALUES ('{A}', 1000, 2000)"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetAvailability {
                person_id: ulid(A),
                start: 1000,
                end: 2000,
            }
        );
    }

    #[test]
    fn parse_insert_availability_negative_start() {
        let sql = format!(r#"INSERT INTO availability (person_id, start, "end") VALUES ('{A}', -5, 10)"#);
        match parse_sql(&sql).unwrap() {
            Command::SetAvailability { start, end, .. } => {
                assert_eq!(start, -5);
                assert_eq!(end, 10);
            }
            cmd => panic!("expected SetAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_availability_unbounded() {
        let sql = format!("SELECT * FROM availability WHERE person_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::GetAvailability {
                person_id: ulid(A),
                start: None,
                end: None,
            }
        );
    }

    #[test]
    fn parse_select_availability_with_range() {
        let sql = format!(
            r#"SELECT * FROM availability WHERE person_id = '{A}' AND start >= 100 AND "end" <= 900"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::GetAvailability {
                person_id: ulid(A),
                start: Some(100),
                end: Some(900),
            }
        );
    }

    #[test]
    fn parse_select_availability_missing_person() {
        let result = parse_sql("SELECT * FROM availability WHERE start >= 100");
        assert!(matches!(result, Err(SqlError::MissingFilter("person_id"))));
    }

    #[test]
    fn parse_select_overlap() {
        let sql = format!("SELECT * FROM overlap WHERE person_a = '{A}' AND person_b = '{B}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::FindOverlap {
                person_a: ulid(A),
                person_b: ulid(B),
            }
        );
    }

    #[test]
    fn parse_select_overlap_missing_b() {
        let sql = format!("SELECT * FROM overlap WHERE person_a = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("person_b"))));
    }

    #[test]
    fn parse_insert_meeting() {
        let sql = format!(
            r#"INSERT INTO meetings (person_a, person_b, start, "end") VALUES ('{A}', '{B}', 100, 200)"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::ScheduleMeeting {
                person_a: ulid(A),
                person_b: ulid(B),
                start: 100,
                end: 200,
                returning: false,
            }
        );
    }

    #[test]
    fn parse_insert_meeting_returning_id() {
        let sql = format!(
            r#"INSERT INTO meetings (person_a, person_b, start, "end") VALUES ('{A}', '{B}', 100, 200) RETURNING id"#
        );
        match parse_sql(&sql).unwrap() {
            Command::ScheduleMeeting { returning, .. } => assert!(returning),
            cmd => panic!("expected ScheduleMeeting, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_meeting_returning_other_column_errors() {
        let sql = format!(
            r#"INSERT INTO meetings (person_a, person_b, start, "end") VALUES ('{A}', '{B}', 100, 200) RETURNING start"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_meetings() {
        let sql = format!("SELECT * FROM meetings WHERE person_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::ListMeetings { person_id: ulid(A) }
        );
    }

    #[test]
    fn parse_bad_ulid_errors() {
        let sql = "SELECT * FROM meetings WHERE person_id = 'not-a-ulid'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_multi_row_insert_errors() {
        let sql = format!(
            r#"INSERT INTO availability (person_id, start, "end") VALUES ('{A}', 1, 2), ('{A}', 3, 4)"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_or_filter_errors() {
        let sql = format!("SELECT * FROM meetings WHERE person_id = '{A}' OR person_id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let result = parse_sql("SELECT * FROM rooms");
        assert!(matches!(result, Err(SqlError::UnknownTable(t)) if t == "rooms"));
    }

    #[test]
    fn parse_update_unsupported() {
        let sql = format!("UPDATE people SET name = 'x' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn parse_trailing_statement_errors() {
        let sql = format!("SELECT * FROM people; INSERT INTO people (id, name) VALUES ('{A}', 'Ada')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        assert_eq!(parse_sql("SELECT * FROM people;").unwrap(), Command::ListPeople);
    }

    #[test]
    fn parse_unsupported_comparisons_error() {
        for sql in [
            format!("SELECT * FROM availability WHERE person_id = '{A}' AND start > 100"),
            format!(r#"SELECT * FROM availability WHERE person_id = '{A}' AND "end" < 900"#),
            format!("SELECT * FROM availability WHERE person_id = '{A}' AND start <= 100"),
            format!("SELECT * FROM availability WHERE person_id <> '{A}'"),
            format!("SELECT * FROM availability WHERE person_id = '{A}' AND name = 'Ada'"),
            format!("SELECT * FROM availability WHERE person_id = '{A}' AND person_id = '{B}'"),
            format!("SELECT * FROM availability WHERE person_id IS NOT NULL"),
        ] {
            assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))), "{sql}");
        }
    }

    #[test]
    fn parse_filters_on_wrong_table_error() {
        for sql in [
            format!("SELECT * FROM meetings WHERE person_id = '{A}' AND start >= 100"),
            format!(r#"SELECT * FROM meetings WHERE person_id = '{A}' AND "end" <= 900"#),
            format!("SELECT * FROM overlap WHERE person_a = '{A}' AND person_b = '{B}' AND start >= 1"),
            format!("SELECT * FROM overlap WHERE person_id = '{A}'"),
            format!("SELECT * FROM availability WHERE person_a = '{A}'"),
            format!("SELECT * FROM people WHERE person_id = '{A}'"),
        ] {
            assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))), "{sql}");
        }
    }

    #[test]
    fn parse_insert_columns_in_any_order() {
        let sql = format!(r#"INSERT INTO availability ("end", start, person_id) VALUES (2000, 1000, '{A}')"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetAvailability {
                person_id: ulid(A),
                start: 1000,
                end: 2000,
            }
        );

        let sql = format!(
            r#"INSERT INTO meetings (person_b, "end", person_a, start) VALUES ('{B}', 200, '{A}', 100)"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::ScheduleMeeting {
                person_a: ulid(A),
                person_b: ulid(B),
                start: 100,
                end: 200,
                returning: false,
            }
        );
    }

    #[test]
    fn parse_insert_without_column_list_is_positional() {
        let sql = format!("INSERT INTO people VALUES ('{A}', 'Ada')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::RegisterPerson {
                id: ulid(A),
                name: "Ada".into(),
            }
        );
    }

    #[test]
    fn parse_insert_bad_column_lists_error() {
        let unknown = format!("INSERT INTO people (id, nickname) VALUES ('{A}', 'Ada')");
        assert!(matches!(parse_sql(&unknown), Err(SqlError::Unsupported(_))));

        let repeated = format!("INSERT INTO people (id, id) VALUES ('{A}', '{B}')");
        assert!(matches!(parse_sql(&repeated), Err(SqlError::Parse(_))));

        let mismatched = format!("INSERT INTO people (id, name) VALUES ('{A}')");
        assert!(matches!(parse_sql(&mismatched), Err(SqlError::Parse(_))));
    }
}
