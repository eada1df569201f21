use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::catalog::{CarChanges, NewCar};
use crate::model::*;

/// Car lookup: by id, by status, or by free-text search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarQuery {
    pub id: Option<Ulid>,
    pub status: Option<CarStatus>,
    pub search: Option<String>,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCar {
        car: NewCar,
        returning: bool,
    },
    UpdateCar {
        id: Ulid,
        changes: CarChanges,
        returning: bool,
    },
    InsertReservation {
        request: NewReservation,
        returning: bool,
    },
    UpdateReservationStatus {
        id: Ulid,
        status: ReservationStatus,
        returning: bool,
    },
    CancelReservation {
        id: Ulid,
        returning: bool,
    },
    SelectCars(CarQuery),
    SelectReservations(ReservationFilter),
    SelectAvailableCars {
        start: NaiveDate,
        end: NaiveDate,
    },
    SelectQuote {
        car_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    },
    SelectSalesSummary {
        from: NaiveDate,
        to: NaiveDate,
    },
    SelectMonthlySummary {
        from: NaiveDate,
        to: NaiveDate,
    },
    SelectCarPerformance {
        from: NaiveDate,
        to: NaiveDate,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(&table.relation, assignments, selection, returning.is_some()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "cars" => {
            let mut f = insert_fields("cars", insert)?;
            let car = NewCar {
                make: parse_text(&f.require("make")?)?,
                model: parse_text(&f.require("model")?)?,
                year: parse_i32(&f.require("year")?)?,
                color: parse_text(&f.require("color")?)?,
                license_plate: parse_text(&f.require("license_plate")?)?,
                daily_rate: parse_decimal(&f.require("daily_rate")?)?,
                status: match f.take("status") {
                    Some(e) => parse_enum(&e)?,
                    None => CarStatus::Available,
                },
                location: f.take("location").map(|e| parse_opt_text(&e)).transpose()?.flatten(),
                description: f.take("description").map(|e| parse_opt_text(&e)).transpose()?.flatten(),
            };
            f.finish()?;
            Ok(Command::InsertCar { car, returning })
        }
        "reservations" => {
            let mut f = insert_fields("reservations", insert)?;
            let request = NewReservation {
                car_id: parse_ulid(&f.require("car_id")?)?,
                start_date: parse_date(&f.require("start_date")?)?,
                end_date: parse_date(&f.require("end_date")?)?,
                customer: CustomerContact {
                    name: parse_text(&f.require("customer_name")?)?,
                    email: parse_text(&f.require("customer_email")?)?,
                    phone: f.take("customer_phone").map(|e| parse_opt_text(&e)).transpose()?.flatten(),
                },
                notes: f.take("notes").map(|e| parse_opt_text(&e)).transpose()?.flatten(),
            };
            f.finish()?;
            Ok(Command::InsertReservation { request, returning })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut set = Fields::new("SET");
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        set.push(column, assignment.value.clone());
    }
    let mut filter = where_fields(selection)?;
    let id = parse_ulid(&filter.require("id")?)?;
    filter.finish()?;

    match table.as_str() {
        "cars" => {
            let changes = CarChanges {
                make: set.take("make").map(|e| parse_text(&e)).transpose()?,
                model: set.take("model").map(|e| parse_text(&e)).transpose()?,
                year: set.take("year").map(|e| parse_i32(&e)).transpose()?,
                color: set.take("color").map(|e| parse_text(&e)).transpose()?,
                license_plate: set.take("license_plate").map(|e| parse_text(&e)).transpose()?,
                daily_rate: set.take("daily_rate").map(|e| parse_decimal(&e)).transpose()?,
                status: set.take("status").map(|e| parse_enum(&e)).transpose()?,
                location: set.take("location").map(|e| parse_text(&e)).transpose()?,
                description: set.take("description").map(|e| parse_text(&e)).transpose()?,
            };
            set.finish()?;
            if changes.is_empty() {
                return Err(SqlError::Parse("UPDATE cars without assignments".into()));
            }
            Ok(Command::UpdateCar { id, changes, returning })
        }
        "reservations" => {
            let status = parse_enum(&set.require("status")?)?;
            set.finish()?;
            Ok(Command::UpdateReservationStatus { id, status, returning })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filter = where_fields(&delete.selection)?;
    let id = parse_ulid(&filter.require("id")?)?;
    filter.finish()?;

    match table.as_str() {
        // Reservations are never removed; DELETE cancels.
        "reservations" => Ok(Command::CancelReservation {
            id,
            returning: delete.returning.is_some(),
        }),
        "cars" => Err(SqlError::Unsupported(
            "cars cannot be deleted; set status instead".into(),
        )),
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
    let mut f = where_fields(&select.selection)?;

    let cmd = match table.as_str() {
        "cars" => Command::SelectCars(CarQuery {
            id: f.take("id").map(|e| parse_ulid(&e)).transpose()?,
            status: f.take("status").map(|e| parse_enum(&e)).transpose()?,
            search: f.take("search").map(|e| parse_text(&e)).transpose()?,
        }),
        "reservations" => Command::SelectReservations(ReservationFilter {
            id: f.take("id").map(|e| parse_ulid(&e)).transpose()?,
            car_id: f.take("car_id").map(|e| parse_ulid(&e)).transpose()?,
            customer_email: f.take("customer_email").map(|e| parse_text(&e)).transpose()?,
            status: f.take("status").map(|e| parse_enum(&e)).transpose()?,
        }),
        "available_cars" => Command::SelectAvailableCars {
            start: parse_date(&f.require("start_date")?)?,
            end: parse_date(&f.require("end_date")?)?,
        },
        "quote" => Command::SelectQuote {
            car_id: parse_ulid(&f.require("car_id")?)?,
            start: parse_date(&f.require("start_date")?)?,
            end: parse_date(&f.require("end_date")?)?,
        },
        "sales_summary" => Command::SelectSalesSummary {
            from: parse_date(&f.require("from_date")?)?,
            to: parse_date(&f.require("to_date")?)?,
        },
        "monthly_summary" => Command::SelectMonthlySummary {
            from: parse_date(&f.require("from_date")?)?,
            to: parse_date(&f.require("to_date")?)?,
        },
        "car_performance" => Command::SelectCarPerformance {
            from: parse_date(&f.require("from_date")?)?,
            to: parse_date(&f.require("to_date")?)?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    f.finish()?;
    Ok(cmd)
}

// ── Column/value pairs ────────────────────────────────────────

/// Named expressions from a column list, a SET clause or a WHERE clause.
/// Every entry must be consumed; leftovers are reported by `finish`.
struct Fields {
    context: &'static str,
    entries: Vec<(String, Expr)>,
}

impl Fields {
    fn new(context: &'static str) -> Self {
        Self {
            context,
            entries: Vec::new(),
        }
    }

    fn push(&mut self, column: String, value: Expr) {
        self.entries.push((column, value));
    }

    fn take(&mut self, column: &str) -> Option<Expr> {
        let pos = self.entries.iter().position(|(c, _)| c == column)?;
        Some(self.entries.remove(pos).1)
    }

    fn require(&mut self, column: &'static str) -> Result<Expr, SqlError> {
        self.take(column).ok_or(SqlError::Missing(self.context, column))
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.entries.into_iter().next() {
            Some((column, _)) => Err(SqlError::UnexpectedColumn(self.context, column)),
            None => Ok(()),
        }
    }
}

fn insert_fields(table: &'static str, insert: &ast::Insert) -> Result<Fields, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
    }
    let values = extract_insert_values(insert)?;
    if values.len() != insert.columns.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
    }
    let mut fields = Fields::new(table);
    for (column, value) in insert.columns.iter().zip(values) {
        fields.push(column.value.to_lowercase(), value);
    }
    Ok(fields)
}

/// `col = literal [AND col = literal ...]`; anything else is rejected.
fn where_fields(selection: &Option<Expr>) -> Result<Fields, SqlError> {
    let mut fields = Fields::new("WHERE");
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut fields)?;
    }
    Ok(fields)
}

fn collect_eq_filters(expr: &Expr, fields: &mut Fields) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, fields),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, fields)?;
            collect_eq_filters(right, fields)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            fields.push(column, right.as_ref().clone());
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

/// String literal or bare number, as text.
fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_opt_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_text(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    // DATE '2024-06-01' arrives as a typed string
    let s = match expr {
        Expr::TypedString(typed) => match &typed.value.value {
            Value::SingleQuotedString(s) => s.clone(),
            other => return Err(SqlError::Parse(format!("expected date string, got {other}"))),
        },
        _ => parse_text(expr)?,
    };
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_decimal(expr)?);
    }
    let s = parse_text(expr)?;
    Decimal::from_str(s.trim()).map_err(|e| SqlError::Parse(format!("bad decimal {s:?}: {e}")))
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let s = parse_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_enum<T: FromStr<Err = String>>(expr: &Expr) -> Result<T, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::Parse)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    Missing(&'static str, &'static str),
    UnexpectedColumn(&'static str, String),
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
            SqlError::Missing(context, col) => write!(f, "{context}: missing {col}"),
            SqlError::UnexpectedColumn(context, col) => write!(f, "{context}: unexpected column {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
