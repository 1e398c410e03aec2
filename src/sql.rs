use std::collections::HashMap;

use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Hall-staff transition applied through `visit_transitions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitAction {
    Approve,
    Decline,
    Start,
    End,
}

impl VisitAction {
    fn parse(s: &str) -> Result<Self, SqlError> {
        match s.to_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "decline" => Ok(Self::Decline),
            "start" => Ok(Self::Start),
            "end" => Ok(Self::End),
            _ => Err(SqlError::UnknownAction(s.to_string())),
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRestaurant {
        id: Ulid,
        owner_id: Ulid,
        name: String,
        settings: RestaurantSettings,
    },
    UpdateSettings {
        restaurant_id: Ulid,
        settings: RestaurantSettings,
    },
    VerifyRestaurant {
        restaurant_id: Ulid,
    },
    DeleteRestaurant {
        id: Ulid,
    },
    InsertTable {
        restaurant_id: Ulid,
        table_id: TableId,
        capacity: u32,
    },
    UpdateTableCapacity {
        restaurant_id: Ulid,
        table_id: TableId,
        capacity: u32,
    },
    DeleteTable {
        restaurant_id: Ulid,
        table_id: TableId,
    },
    InsertEmployee {
        restaurant_id: Ulid,
        user_id: Ulid,
        hall_access: bool,
    },
    SetOnDuty {
        restaurant_id: Ulid,
        user_id: Ulid,
        on_duty: bool,
    },
    DeleteEmployee {
        restaurant_id: Ulid,
        user_id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        restaurant_id: Ulid,
        party_size: u32,
        start: Ms,
        end: Ms,
        takeaway: bool,
    },
    InsertWalkIn {
        id: Ulid,
        restaurant_id: Ulid,
        party_size: u32,
        table_id: Option<TableId>,
        takeaway: bool,
    },
    TransitionVisit {
        visit_id: Ulid,
        action: VisitAction,
    },
    ReassignTable {
        visit_id: Ulid,
        table_id: TableId,
    },
    CancelVisit {
        id: Ulid,
    },
    SelectAvailableTables {
        restaurant_id: Ulid,
        party_size: u32,
        start: Ms,
        end: Ms,
    },
    SelectRestaurants,
    SelectTables {
        restaurant_id: Ulid,
    },
    SelectVisits {
        restaurant_id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    SelectVisit {
        id: Ulid,
    },
    SelectUserReservations {
        user_id: Ulid,
    },
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts)
}

/// Parse exactly one statement (extended protocol).
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match parse_statements(sql)?.as_slice() {
        [stmt] => parse_statement(stmt),
        _ => Err(SqlError::Unsupported("multiple statements in one prepared query".into())),
    }
}

/// Parse a `;`-separated simple query into commands, in order.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    parse_statements(sql)?.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Default column order when an INSERT omits its column list.
fn default_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "restaurants" => &["id", "owner_id", "name", "max_reservation_minutes", "deposit"],
        "restaurant_settings" => &["restaurant_id", "max_reservation_minutes", "deposit"],
        "verifications" => &["restaurant_id"],
        "tables" | "table_capacities" => &["restaurant_id", "table_id", "capacity"],
        "employees" => &["restaurant_id", "user_id", "hall_access"],
        "shifts" => &["restaurant_id", "user_id", "on_duty"],
        "reservations" => &["id", "restaurant_id", "party_size", "start", "end", "takeaway"],
        "walk_ins" => &["id", "restaurant_id", "party_size", "table_id", "takeaway"],
        "visit_transitions" => &["visit_id", "action"],
        "table_assignments" => &["visit_id", "table_id"],
        _ => return None,
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let defaults = default_columns(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    let row = Row::from_insert(insert, defaults)?;

    match table.as_str() {
        "restaurants" => Ok(Command::InsertRestaurant {
            id: parse_ulid(row.required("id")?)?,
            owner_id: parse_ulid(row.required("owner_id")?)?,
            name: parse_string(row.required("name")?)?,
            settings: row.settings()?,
        }),
        "restaurant_settings" => Ok(Command::UpdateSettings {
            restaurant_id: parse_ulid(row.required("restaurant_id")?)?,
            settings: row.settings()?,
        }),
        "verifications" => Ok(Command::VerifyRestaurant {
            restaurant_id: parse_ulid(row.required("restaurant_id")?)?,
        }),
        "tables" | "table_capacities" => {
            let restaurant_id = parse_ulid(row.required("restaurant_id")?)?;
            let table_id = parse_u32(row.required("table_id")?)?;
            let capacity = parse_u32(row.required("capacity")?)?;
            if table == "tables" {
                Ok(Command::InsertTable { restaurant_id, table_id, capacity })
            } else {
                Ok(Command::UpdateTableCapacity { restaurant_id, table_id, capacity })
            }
        }
        "employees" => Ok(Command::InsertEmployee {
            restaurant_id: parse_ulid(row.required("restaurant_id")?)?,
            user_id: parse_ulid(row.required("user_id")?)?,
            hall_access: row.optional("hall_access").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        "shifts" => Ok(Command::SetOnDuty {
            restaurant_id: parse_ulid(row.required("restaurant_id")?)?,
            user_id: parse_ulid(row.required("user_id")?)?,
            on_duty: parse_bool(row.required("on_duty")?)?,
        }),
        "reservations" => Ok(Command::InsertReservation {
            id: parse_ulid(row.required("id")?)?,
            restaurant_id: parse_ulid(row.required("restaurant_id")?)?,
            party_size: parse_u32(row.required("party_size")?)?,
            start: parse_i64(row.required("start")?)?,
            end: parse_i64(row.required("end")?)?,
            takeaway: row.optional("takeaway").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        "walk_ins" => Ok(Command::InsertWalkIn {
            id: parse_ulid(row.required("id")?)?,
            restaurant_id: parse_ulid(row.required("restaurant_id")?)?,
            party_size: parse_u32(row.required("party_size")?)?,
            table_id: match row.optional("table_id") {
                Some(expr) => parse_u32_or_null(expr)?,
                None => None,
            },
            takeaway: row.optional("takeaway").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        "visit_transitions" => Ok(Command::TransitionVisit {
            visit_id: parse_ulid(row.required("visit_id")?)?,
            action: VisitAction::parse(&parse_string(row.required("action")?)?)?,
        }),
        "table_assignments" => Ok(Command::ReassignTable {
            visit_id: parse_ulid(row.required("visit_id")?)?,
            table_id: parse_u32(row.required("table_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "restaurants" => Ok(Command::DeleteRestaurant {
            id: parse_ulid(filters.eq("id")?)?,
        }),
        "tables" => Ok(Command::DeleteTable {
            restaurant_id: parse_ulid(filters.eq("restaurant_id")?)?,
            table_id: parse_u32(filters.eq("table_id")?)?,
        }),
        "employees" => Ok(Command::DeleteEmployee {
            restaurant_id: parse_ulid(filters.eq("restaurant_id")?)?,
            user_id: parse_ulid(filters.eq("user_id")?)?,
        }),
        "visits" | "reservations" => Ok(Command::CancelVisit {
            id: parse_ulid(filters.eq("id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

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
        "available_tables" => Ok(Command::SelectAvailableTables {
            restaurant_id: parse_ulid(filters.eq("restaurant_id")?)?,
            party_size: parse_u32(filters.eq("party_size")?)?,
            start: parse_i64(filters.lower("start")?)?,
            end: parse_i64(filters.upper("end")?)?,
        }),
        "restaurants" => Ok(Command::SelectRestaurants),
        "tables" => Ok(Command::SelectTables {
            restaurant_id: parse_ulid(filters.eq("restaurant_id")?)?,
        }),
        "visits" => {
            if let Ok(id) = filters.eq("id") {
                return Ok(Command::SelectVisit { id: parse_ulid(id)? });
            }
            Ok(Command::SelectVisits {
                restaurant_id: parse_ulid(filters.eq("restaurant_id")?)?,
                start: filters.lower("start").ok().map(parse_i64).transpose()?,
                end: filters.upper("end").ok().map(parse_i64).transpose()?,
            })
        }
        "user_reservations" => Ok(Command::SelectUserReservations {
            user_id: parse_ulid(filters.eq("user_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Rows & filters ────────────────────────────────────────────

/// A single VALUES row keyed by lowercase column name.
struct Row {
    values: HashMap<String, Expr>,
}

impl Row {
    fn from_insert(insert: &ast::Insert, defaults: &'static [&'static str]) -> Result<Self, SqlError> {
        let body = insert
            .source
            .as_ref()
            .ok_or(SqlError::Parse("no VALUES".into()))?;
        let rows = match body.body.as_ref() {
            SetExpr::Values(values) => &values.rows,
            _ => return Err(SqlError::Parse("expected VALUES".into())),
        };
        let exprs = match rows.as_slice() {
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            [row] => row,
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        };

        let columns: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if exprs.len() > columns.len() {
            return Err(SqlError::WrongArity(columns.len(), exprs.len()));
        }

        Ok(Self {
            values: columns.into_iter().zip(exprs.iter().cloned()).collect(),
        })
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.values.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn optional(&self, column: &str) -> Option<&Expr> {
        self.values.get(column)
    }

    fn settings(&self) -> Result<RestaurantSettings, SqlError> {
        Ok(RestaurantSettings {
            max_reservation_minutes: parse_u32(self.required("max_reservation_minutes")?)?,
            reservation_deposit: match self.optional("deposit") {
                Some(expr) => parse_u64_or_null(expr)?,
                None => None,
            },
        })
    }
}

/// Conjunction of `col = v`, `col >= v` and `col <= v` terms from a WHERE clause.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    lower: HashMap<String, Expr>,
    upper: HashMap<String, Expr>,
}

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                let target = match op {
                    ast::BinaryOperator::And => {
                        self.collect(left)?;
                        return self.collect(right);
                    }
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.lower,
                    ast::BinaryOperator::LtEq => &mut self.upper,
                    other => return Err(SqlError::Unsupported(format!("operator {other}"))),
                };
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                target.insert(col, (**right).clone());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn eq(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.eq.get(column).ok_or(SqlError::MissingFilter(column))
    }

    fn lower(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.lower.get(column).ok_or(SqlError::MissingFilter(column))
    }

    fn upper(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.upper.get(column).ok_or(SqlError::MissingFilter(column))
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
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

fn parse_u64_or_null(expr: &Expr) -> Result<Option<u64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let v = parse_i64(expr)?;
    u64::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("{v} out of u64 range")))
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
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("expected at most {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("unknown visit action: {0} (expected approve, decline, start or end)")]
    UnknownAction(String),
}
