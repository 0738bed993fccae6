use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::engine::AllocationFilter;
use crate::model::*;
use crate::time::parse_datetime;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        name: String,
        kind: String,
    },
    UpdateResource {
        id: ResourceId,
        name: Option<String>,
        kind: Option<String>,
    },
    DeleteResource {
        id: ResourceId,
    },
    InsertEvent {
        draft: EventDraft,
    },
    UpdateEvent {
        id: EventId,
        changes: EventChanges,
    },
    DeleteEvent {
        id: EventId,
    },
    SelectResources,
    SelectEvents,
    SelectAllocations {
        filter: AllocationFilter,
    },
    SelectConflictCheck {
        start: Ms,
        end: Ms,
        resource_ids: Vec<ResourceId>,
        exclude_event_id: Option<EventId>,
    },
    SelectConflicts,
    SelectUtilization {
        start: Ms,
        end: Ms,
        now: Option<Ms>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(SqlError::Empty);
    }
    if trimmed
        .get(..7)
        .is_some_and(|head| head.eq_ignore_ascii_case("UPDATE "))
    {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "resources" => {
            let cols = named_values(insert, &values, &["name", "kind"])?;
            Ok(Command::InsertResource {
                name: parse_string(required(&cols, "name")?)?,
                kind: parse_string(required(&cols, "kind")?)?,
            })
        }
        "events" => {
            let cols = named_values(
                insert,
                &values,
                &["title", "start", "end", "description", "resources"],
            )?;
            let description = match lookup(&cols, "description") {
                Some(expr) => parse_string_or_null(expr)?.unwrap_or_default(),
                None => String::new(),
            };
            let resource_ids = match lookup(&cols, "resources") {
                Some(expr) => parse_id_list_expr(expr)?,
                None => Vec::new(),
            };
            Ok(Command::InsertEvent {
                draft: EventDraft {
                    title: parse_string(required(&cols, "title")?)?,
                    description,
                    start: parse_datetime_expr(required(&cols, "start")?)?,
                    end: parse_datetime_expr(required(&cols, "end")?)?,
                    resource_ids,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Pair VALUES with their column names. Without a column list, `defaults`
/// gives the positional order.
fn named_values<'a>(
    insert: &ast::Insert,
    values: &'a [Expr],
    defaults: &[&str],
) -> Result<Vec<(String, &'a Expr)>, SqlError> {
    let names: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|s| s.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > names.len() {
        return Err(SqlError::WrongArity("VALUES", names.len(), values.len()));
    }
    for name in &names {
        if !defaults.contains(&name.as_str()) {
            return Err(SqlError::UnknownColumn(name.clone()));
        }
    }
    Ok(names.into_iter().zip(values.iter()).collect())
}

fn lookup<'a>(cols: &[(String, &'a Expr)], name: &str) -> Option<&'a Expr> {
    cols.iter().find(|(n, _)| n == name).map(|(_, e)| *e)
}

fn required<'a>(cols: &[(String, &'a Expr)], name: &'static str) -> Result<&'a Expr, SqlError> {
    lookup(cols, name).ok_or(SqlError::MissingColumn(name))
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(sql)
        .map_err(|e| SqlError::Parse(e.to_string()))?;
    let perr = |e: sqlparser::parser::ParserError| SqlError::Parse(e.to_string());

    parser.expect_keyword(Keyword::UPDATE).map_err(perr)?;
    let table = parser.parse_table_and_joins().map_err(perr)?;
    let table = table_factor_name(&table.relation)?;
    parser.expect_keyword(Keyword::SET).map_err(perr)?;
    let assignments = parser
        .parse_comma_separated(Parser::parse_assignment)
        .map_err(perr)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr().map_err(perr)?)
    } else {
        None
    };
    parser.consume_token(&Token::SemiColon);
    if parser.peek_token().token != Token::EOF {
        return Err(SqlError::Unsupported("trailing input after UPDATE".into()));
    }
    let id = extract_where_id(&selection)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for assignment in &assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((column, &assignment.value));
    }

    match table.as_str() {
        "resources" => {
            let (mut name, mut kind) = (None, None);
            for (column, value) in sets {
                match column.as_str() {
                    "name" => name = Some(parse_string(value)?),
                    "kind" => kind = Some(parse_string(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateResource { id, name, kind })
        }
        "events" => {
            let mut changes = EventChanges::default();
            for (column, value) in sets {
                match column.as_str() {
                    "title" => changes.title = Some(parse_string(value)?),
                    "description" => {
                        changes.description = Some(parse_string_or_null(value)?.unwrap_or_default())
                    }
                    "start" => changes.start = Some(parse_datetime_expr(value)?),
                    "end" => changes.end = Some(parse_datetime_expr(value)?),
                    "resources" => changes.resource_ids = Some(parse_id_list_expr(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateEvent { id, changes })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "events" => Ok(Command::DeleteEvent { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// Values pulled out of a conjunction of simple comparisons.
#[derive(Default)]
struct Filters {
    start: Option<Ms>,
    end: Option<Ms>,
    now: Option<Ms>,
    resource_ids: Option<Vec<ResourceId>>,
    exclude_event_id: Option<EventId>,
    event_id: Option<EventId>,
    resource_id: Option<ResourceId>,
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "events" => Ok(Command::SelectEvents),
        "allocations" => {
            let filter = match (filters.event_id, filters.resource_id) {
                (Some(id), _) => AllocationFilter::Event(id),
                (None, Some(id)) => AllocationFilter::Resource(id),
                (None, None) => AllocationFilter::All,
            };
            Ok(Command::SelectAllocations { filter })
        }
        "conflict_check" => Ok(Command::SelectConflictCheck {
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
            resource_ids: filters
                .resource_ids
                .ok_or(SqlError::MissingFilter("resources"))?,
            exclude_event_id: filters.exclude_event_id,
        }),
        "conflicts" => Ok(Command::SelectConflicts),
        "utilization" => Ok(Command::SelectUtilization {
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
            now: filters.now,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("resources") => filters.resource_ids = Some(parse_id_list_expr(right)?),
                Some("exclude_event_id") => filters.exclude_event_id = Some(parse_u64_expr(right)?),
                Some("event_id") => filters.event_id = Some(parse_u64_expr(right)?),
                Some("resource_id") => filters.resource_id = Some(parse_u64_expr(right)?),
                Some("now") => filters.now = Some(parse_datetime_expr(right)?),
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    filters.start = Some(parse_datetime_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    filters.end = Some(parse_datetime_expr(right)?);
                }
            }
            _ => {}
        },
        _ => {}
    }
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<u64, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_u64_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_u64_expr(expr: &Expr) -> Result<u64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad id '{s}': {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected id, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_datetime_expr(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => parse_datetime(s)
            .map_err(|e| SqlError::Parse(format!("bad timestamp '{s}' (want YYYY-MM-DDThh:mm): {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected timestamp string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// `'1,2,3'` or a bare number. Empty string means no resources.
fn parse_id_list_expr(expr: &Expr) -> Result<Vec<ResourceId>, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => parse_id_list(s),
        Some(Value::Number(_, _)) => Ok(vec![parse_u64_expr(expr)?]),
        Some(Value::Null) => Ok(Vec::new()),
        Some(value) => Err(SqlError::Parse(format!("expected id list, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

pub fn parse_id_list(s: &str) -> Result<Vec<ResourceId>, SqlError> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse()
                .map_err(|e| SqlError::Parse(format!("bad id '{part}': {e}")))
        })
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
