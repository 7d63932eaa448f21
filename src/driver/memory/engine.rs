use crate::core::{DriverError, DriverResult, FieldInfo, FieldType, ParamInfo, Value};
use crate::driver::memory::codes;
use crate::driver::memory::sql::{BinaryOp, Command, Expr, Select, SelectItem};
use crate::driver::memory::storage::{BlobStore, ColumnDef, Table, Tables};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

/// One-row table without columns, for `SELECT <expr> FROM RDB$DATABASE`.
pub const DUAL_TABLE: &str = "RDB$DATABASE";

/// Everything a command may read or change.
pub struct Scope<'a> {
    pub tables: &'a mut Tables,
    pub touched: &'a mut HashSet<String>,
    pub generators: &'a mut BTreeMap<String, i64>,
    pub blobs: &'a mut BlobStore,
    /// `None` when writes are allowed, else the error to report.
    pub read_only: Option<DriverError>,
}

#[derive(Debug)]
pub enum Outcome {
    Done,
    Affected(u64),
    Rows {
        fields: Vec<FieldInfo>,
        rows: Vec<Vec<Value>>,
    },
}

pub fn run(command: &Command, args: &[Value], scope: &mut Scope<'_>) -> DriverResult<Outcome> {
    if command.is_write()
        && let Some(err) = &scope.read_only
    {
        return Err(err.clone());
    }

    match command {
        Command::CreateTable {
            name,
            columns,
            if_not_exists,
        } => {
            if scope.tables.contains_key(name) || name == DUAL_TABLE {
                if *if_not_exists {
                    return Ok(Outcome::Done);
                }
                return Err(meta_error(format!("Table {} already exists", name)));
            }
            let mut seen = HashSet::new();
            if let Some(dup) = columns.iter().find(|c| !seen.insert(c.name.as_str())) {
                return Err(meta_error(format!("Column {} specified more than once", dup.name)));
            }
            scope
                .tables
                .insert(name.clone(), Table::new(name.clone(), columns.clone()));
            scope.touched.insert(name.clone());
            Ok(Outcome::Done)
        }
        Command::DropTable { name, if_exists } => {
            if scope.tables.remove(name).is_none() {
                if *if_exists {
                    return Ok(Outcome::Done);
                }
                return Err(relation_error(name));
            }
            scope.touched.insert(name.clone());
            Ok(Outcome::Done)
        }
        Command::CreateSequence { name, if_not_exists } => {
            if scope.generators.contains_key(name) {
                if *if_not_exists {
                    return Ok(Outcome::Done);
                }
                return Err(meta_error(format!("Generator {} already exists", name)));
            }
            scope.generators.insert(name.clone(), 0);
            Ok(Outcome::Done)
        }
        Command::DropSequence { name, if_exists } => {
            if scope.generators.remove(name).is_none() && !*if_exists {
                return Err(generator_error(name));
            }
            Ok(Outcome::Done)
        }
        Command::Insert {
            table,
            columns,
            rows,
        } => insert(scope, table, columns.as_deref(), rows, args),
        Command::Select(select) => query(scope, select, args),
        Command::Update {
            table,
            assignments,
            filter,
        } => update(scope, table, assignments, filter.as_ref(), args),
        Command::Delete { table, filter } => delete(scope, table, filter.as_ref(), args),
    }
}

/// Checks at prepare time that every table a DML statement names exists.
pub fn validate(command: &Command, tables: &Tables) -> DriverResult<()> {
    let table = match command {
        Command::Insert { table, .. } | Command::Update { table, .. } | Command::Delete { table, .. } => table,
        Command::Select(Select { table: Some(table), .. }) if table != DUAL_TABLE => table,
        _ => return Ok(()),
    };
    if tables.contains_key(table) {
        Ok(())
    } else {
        Err(relation_error(table))
    }
}

/// Parameter metadata, inferred from the columns each placeholder is bound against.
pub fn describe_params(command: &Command, params: usize, tables: &Tables) -> Vec<ParamInfo> {
    let mut hints: Vec<(usize, String)> = Vec::new();
    let table_name = match command {
        Command::Insert {
            table,
            columns,
            rows,
        } => {
            let names: Vec<String> = match (columns, tables.get(table)) {
                (Some(cols), _) => cols.clone(),
                (None, Some(t)) => t.columns.iter().map(|c| c.name.clone()).collect(),
                (None, None) => Vec::new(),
            };
            for row in rows {
                for (expr, name) in row.iter().zip(&names) {
                    if let Expr::Param(p) = expr {
                        hints.push((*p, name.clone()));
                    }
                }
            }
            Some(table)
        }
        Command::Update {
            table,
            assignments,
            filter,
        } => {
            for (column, expr) in assignments {
                if let Expr::Param(p) = expr {
                    hints.push((*p, column.clone()));
                }
                expr.param_columns(&mut hints);
            }
            if let Some(f) = filter {
                f.param_columns(&mut hints);
            }
            Some(table)
        }
        Command::Delete { table, filter } => {
            if let Some(f) = filter {
                f.param_columns(&mut hints);
            }
            Some(table)
        }
        Command::Select(select) => {
            if let Some(f) = &select.filter {
                f.param_columns(&mut hints);
            }
            select.table.as_ref()
        }
        _ => None,
    };

    let table = table_name.and_then(|name| tables.get(name));
    (0..params)
        .map(|p| {
            let column = hints
                .iter()
                .find(|(idx, _)| *idx == p)
                .and_then(|(_, name)| table.and_then(|t| t.column_index(name).map(|i| (t, &t.columns[i]))));
            match column {
                Some((t, c)) => field_info(t, c, &c.name),
                None => FieldInfo {
                    name: String::new(),
                    alias: String::new(),
                    relation: String::new(),
                    length: 255,
                    field_type: FieldType::Varchar,
                },
            }
        })
        .collect()
}

fn field_info(table: &Table, column: &ColumnDef, alias: &str) -> FieldInfo {
    FieldInfo {
        name: column.name.clone(),
        alias: alias.to_string(),
        relation: table.name.clone(),
        length: column.length,
        field_type: column.field_type,
    }
}

fn insert(
    scope: &mut Scope<'_>,
    table_name: &str,
    columns: Option<&[String]>,
    rows: &[Vec<Expr>],
    args: &[Value],
) -> DriverResult<Outcome> {
    let table = scope
        .tables
        .get(table_name)
        .ok_or_else(|| relation_error(table_name))?;

    let targets: Vec<usize> = match columns {
        Some(names) => names
            .iter()
            .map(|n| table.column(n).map(|(i, _)| i))
            .collect::<DriverResult<_>>()?,
        None => (0..table.columns.len()).collect(),
    };

    let mut new_rows = Vec::with_capacity(rows.len());
    for exprs in rows {
        if exprs.len() != targets.len() {
            return Err(DriverError::new(
                codes::DSQL_ERROR,
                format!(
                    "Count of column list and value list don't match ({} vs {})",
                    targets.len(),
                    exprs.len()
                ),
            ));
        }
        let mut row = vec![Value::Null; table.columns.len()];
        for (expr, &index) in exprs.iter().zip(&targets) {
            let value = eval(expr, &EmptyRow, args)?;
            row[index] = value;
        }
        new_rows.push(row);
    }

    let columns = table.columns.clone();
    let mut stored = Vec::with_capacity(new_rows.len());
    for row in new_rows {
        stored.push(coerce_row(&columns, table_name, row, scope.blobs)?);
    }

    let count = stored.len() as u64;
    if let Some(table) = scope.tables.get_mut(table_name) {
        for row in stored {
            table.rows.push_back(row);
        }
    }
    scope.touched.insert(table_name.to_string());
    Ok(Outcome::Affected(count))
}

fn update(
    scope: &mut Scope<'_>,
    table_name: &str,
    assignments: &[(String, Expr)],
    filter: Option<&Expr>,
    args: &[Value],
) -> DriverResult<Outcome> {
    let table = scope
        .tables
        .get(table_name)
        .ok_or_else(|| relation_error(table_name))?;
    let layout = Layout::of(table);

    let targets: Vec<(usize, &Expr)> = assignments
        .iter()
        .map(|(name, expr)| table.column(name).map(|(i, _)| (i, expr)))
        .collect::<DriverResult<_>>()?;

    let mut changes = Vec::new();
    for (pos, row) in table.rows.iter().enumerate() {
        if !matches_filter(filter, row, &layout, args)? {
            continue;
        }
        let mut updated = row.clone();
        for (index, expr) in &targets {
            updated[*index] = eval(expr, &RowRef { row, layout: &layout }, args)?;
        }
        changes.push((pos, updated));
    }

    let columns = table.columns.clone();
    let mut coerced = Vec::with_capacity(changes.len());
    for (pos, row) in changes {
        coerced.push((pos, coerce_row(&columns, table_name, row, scope.blobs)?));
    }

    let count = coerced.len() as u64;
    if let Some(table) = scope.tables.get_mut(table_name) {
        for (pos, row) in coerced {
            table.rows.set(pos, row);
        }
    }
    scope.touched.insert(table_name.to_string());
    Ok(Outcome::Affected(count))
}

fn delete(
    scope: &mut Scope<'_>,
    table_name: &str,
    filter: Option<&Expr>,
    args: &[Value],
) -> DriverResult<Outcome> {
    let table = scope
        .tables
        .get(table_name)
        .ok_or_else(|| relation_error(table_name))?;
    let layout = Layout::of(table);

    let mut kept = im::Vector::new();
    let mut removed = 0u64;
    for row in table.rows.iter() {
        if matches_filter(filter, row, &layout, args)? {
            removed += 1;
        } else {
            kept.push_back(row.clone());
        }
    }

    if let Some(table) = scope.tables.get_mut(table_name) {
        table.rows = kept;
    }
    scope.touched.insert(table_name.to_string());
    Ok(Outcome::Affected(removed))
}

fn query(scope: &mut Scope<'_>, select: &Select, args: &[Value]) -> DriverResult<Outcome> {
    let dual = Table::new(DUAL_TABLE.to_string(), Vec::new());
    let table = match select.table.as_deref() {
        None | Some(DUAL_TABLE) => &dual,
        Some(name) => scope.tables.get(name).ok_or_else(|| relation_error(name))?,
    };
    let layout = Layout::of(table);
    let source: Vec<Vec<Value>> = if table.name == DUAL_TABLE {
        vec![Vec::new()]
    } else {
        table.rows.iter().cloned().collect()
    };

    let mut matched = Vec::new();
    for row in source {
        if matches_filter(select.filter.as_ref(), &row, &layout, args)? {
            matched.push(row);
        }
    }

    if !select.order_by.is_empty() {
        let mut keyed = Vec::with_capacity(matched.len());
        for row in matched {
            let keys = select
                .order_by
                .iter()
                .map(|o| eval(&o.expr, &RowRef { row: &row, layout: &layout }, args))
                .collect::<DriverResult<Vec<_>>>()?;
            keyed.push((keys, row));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            for ((x, y), order) in a.iter().zip(b).zip(&select.order_by) {
                let ord = x.compare(y).unwrap_or(Ordering::Equal);
                let ord = if order.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        matched = keyed.into_iter().map(|(_, row)| row).collect();
    }

    if let [SelectItem::Expr { expr: Expr::CountAll, alias }] = select.items.as_slice() {
        let fields = vec![FieldInfo {
            name: alias.clone(),
            alias: alias.clone(),
            relation: String::new(),
            length: 8,
            field_type: FieldType::Integer,
        }];
        return Ok(Outcome::Rows {
            fields,
            rows: vec![vec![Value::Integer(matched.len() as i64)]],
        });
    }

    // Resolve the projection once into column picks and computed expressions.
    enum Pick<'e> {
        Column(usize),
        Computed(&'e Expr),
    }
    let mut picks = Vec::new();
    let mut fields = Vec::new();
    for item in &select.items {
        match item {
            SelectItem::Wildcard => {
                for (i, col) in table.columns.iter().enumerate() {
                    picks.push(Pick::Column(i));
                    fields.push(field_info(table, col, &col.name));
                }
            }
            SelectItem::Expr { expr: Expr::Column(name), alias } => {
                let (i, col) = table.column(name)?;
                picks.push(Pick::Column(i));
                fields.push(field_info(table, col, alias));
            }
            SelectItem::Expr { expr: Expr::CountAll, .. } => {
                return Err(DriverError::new(codes::DSQL_ERROR, "COUNT(*) must be the only select item"));
            }
            SelectItem::Expr { expr, alias } => {
                picks.push(Pick::Computed(expr));
                fields.push(FieldInfo {
                    name: alias.clone(),
                    alias: alias.clone(),
                    relation: String::new(),
                    length: 0,
                    field_type: FieldType::Varchar,
                });
            }
        }
    }

    let mut rows = Vec::with_capacity(matched.len());
    for row in &matched {
        let ctx = RowRef { row, layout: &layout };
        let projected = picks
            .iter()
            .map(|pick| match pick {
                Pick::Column(i) => Ok(row[*i].clone()),
                Pick::Computed(expr) => eval(expr, &ctx, args),
            })
            .collect::<DriverResult<Vec<_>>>()?;
        rows.push(projected);
    }

    // Computed columns take the type of their first non-null value.
    for (i, pick) in picks.iter().enumerate() {
        if let Pick::Computed(_) = pick {
            let sample = rows.iter().map(|r| &r[i]).find(|v| !v.is_null());
            let (field_type, length) = match sample {
                Some(Value::Integer(_)) => (FieldType::Integer, 8),
                Some(Value::Float(_)) => (FieldType::Float, 8),
                Some(Value::Boolean(_)) => (FieldType::Boolean, 1),
                Some(Value::Blob(_)) | Some(Value::Bytes(_)) => (FieldType::Blob, 8),
                Some(Value::Text(s)) => (FieldType::Varchar, s.len()),
                Some(Value::Null) | None => (FieldType::Varchar, 0),
            };
            fields[i].field_type = field_type;
            fields[i].length = length;
        }
    }

    Ok(Outcome::Rows { fields, rows })
}

/// Column positions of a table by name.
struct Layout {
    positions: BTreeMap<String, usize>,
}

impl Layout {
    fn of(table: &Table) -> Self {
        Self {
            positions: table
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| (c.name.clone(), i))
                .collect(),
        }
    }
}

/// Row an expression is evaluated against.
trait RowContext {
    fn column(&self, name: &str) -> DriverResult<Value>;
}

struct RowRef<'a> {
    row: &'a [Value],
    layout: &'a Layout,
}

impl RowContext for RowRef<'_> {
    fn column(&self, name: &str) -> DriverResult<Value> {
        self.layout
            .positions
            .get(name)
            .and_then(|&i| self.row.get(i))
            .cloned()
            .ok_or_else(|| DriverError::new(codes::DSQL_FIELD_ERR, format!("Column unknown: {}", name)))
    }
}

struct EmptyRow;

impl RowContext for EmptyRow {
    fn column(&self, name: &str) -> DriverResult<Value> {
        Err(DriverError::new(codes::DSQL_FIELD_ERR, format!("Column unknown: {}", name)))
    }
}

fn matches_filter(filter: Option<&Expr>, row: &[Value], layout: &Layout, args: &[Value]) -> DriverResult<bool> {
    match filter {
        None => Ok(true),
        Some(expr) => Ok(matches!(eval(expr, &RowRef { row, layout }, args)?, Value::Boolean(true))),
    }
}

fn eval(expr: &Expr, ctx: &dyn RowContext, args: &[Value]) -> DriverResult<Value> {
    match expr {
        Expr::Column(name) => ctx.column(name),
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Param(i) => args.get(*i).cloned().ok_or_else(|| {
            DriverError::new(codes::DSQL_ERROR, format!("No value bound for parameter {}", i + 1))
        }),
        Expr::Not(inner) => match eval(inner, ctx, args)? {
            Value::Boolean(b) => Ok(Value::Boolean(!b)),
            Value::Null => Ok(Value::Null),
            other => Err(type_error("NOT", &other)),
        },
        Expr::Negate(inner) => match eval(inner, ctx, args)? {
            Value::Integer(i) => i
                .checked_neg()
                .map(Value::Integer)
                .ok_or_else(|| arith_error("Integer overflow")),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Null => Ok(Value::Null),
            other => Err(type_error("-", &other)),
        },
        Expr::IsNull { expr, negated } => {
            let is_null = eval(expr, ctx, args)?.is_null();
            Ok(Value::Boolean(is_null != *negated))
        }
        Expr::BinaryOp { left, op, right } => {
            let l = eval(left, ctx, args)?;
            let r = eval(right, ctx, args)?;
            binary(*op, l, r)
        }
        Expr::CountAll => Err(DriverError::new(codes::DSQL_ERROR, "COUNT(*) is not allowed here")),
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> DriverResult<Value> {
    match op {
        BinaryOp::And => Ok(match (truth(&l)?, truth(&r)?) {
            (Some(false), _) | (_, Some(false)) => Value::Boolean(false),
            (Some(true), Some(true)) => Value::Boolean(true),
            _ => Value::Null,
        }),
        BinaryOp::Or => Ok(match (truth(&l)?, truth(&r)?) {
            (Some(true), _) | (_, Some(true)) => Value::Boolean(true),
            (Some(false), Some(false)) => Value::Boolean(false),
            _ => Value::Null,
        }),
        _ if l.is_null() || r.is_null() => Ok(Value::Null),
        BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ord = l
                .compare(&r)
                .ok_or_else(|| arith_error(format!("Cannot compare {} with {}", l.type_name(), r.type_name())))?;
            let result = match op {
                BinaryOp::Eq => ord == Ordering::Equal,
                BinaryOp::NotEq => ord != Ordering::Equal,
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::LtEq => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            Ok(Value::Boolean(result))
        }
        BinaryOp::Concat => Ok(Value::Text(format!("{}{}", l, r))),
        BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide => arithmetic(op, l, r),
    }
}

fn truth(v: &Value) -> DriverResult<Option<bool>> {
    match v {
        Value::Boolean(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        other => Err(type_error("boolean operator", other)),
    }
}

fn arithmetic(op: BinaryOp, l: Value, r: Value) -> DriverResult<Value> {
    match (&l, &r) {
        (Value::Integer(a), Value::Integer(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(*b),
                BinaryOp::Subtract => a.checked_sub(*b),
                BinaryOp::Multiply => a.checked_mul(*b),
                _ if *b == 0 => return Err(arith_error("Division by zero")),
                _ => a.checked_div(*b),
            };
            result
                .map(Value::Integer)
                .ok_or_else(|| arith_error("Integer overflow"))
        }
        _ => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                return Err(arith_error(format!(
                    "Arithmetic on {} and {}",
                    l.type_name(),
                    r.type_name()
                )));
            };
            Ok(Value::Float(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Subtract => a - b,
                BinaryOp::Multiply => a * b,
                _ => a / b,
            }))
        }
    }
}

/// Converts a row to the table's column types, storing inline BLOB data.
fn coerce_row(
    columns: &[ColumnDef],
    table: &str,
    row: Vec<Value>,
    blobs: &mut BlobStore,
) -> DriverResult<Vec<Value>> {
    columns
        .iter()
        .zip(row)
        .map(|(col, value)| coerce(col, table, value, blobs))
        .collect()
}

fn coerce(col: &ColumnDef, table: &str, value: Value, blobs: &mut BlobStore) -> DriverResult<Value> {
    if value.is_null() {
        if !col.nullable {
            return Err(DriverError::new(
                codes::NOT_VALID,
                format!("validation error for column \"{}\".\"{}\", value \"*** null ***\"", table, col.name),
            ));
        }
        return Ok(Value::Null);
    }

    let mismatch = |v: &Value| {
        DriverError::new(
            codes::ARITH_EXCEPT,
            format!(
                "conversion error: cannot store {} in {} column {}",
                v.type_name(),
                col.field_type,
                col.name
            ),
        )
    };

    match col.field_type {
        FieldType::Integer => match value {
            Value::Integer(_) => Ok(value),
            Value::Float(f) if f.fract() == 0.0 => value.as_i64().map(Value::Integer).ok_or_else(|| mismatch(&value)),
            Value::Text(ref s) => s.trim().parse().map(Value::Integer).map_err(|_| mismatch(&value)),
            Value::Boolean(b) => Ok(Value::Integer(i64::from(b))),
            ref other => Err(mismatch(other)),
        },
        FieldType::Float => match value {
            Value::Float(_) => Ok(value),
            Value::Integer(i) => Ok(Value::Float(i as f64)),
            Value::Text(ref s) => s.trim().parse().map(Value::Float).map_err(|_| mismatch(&value)),
            ref other => Err(mismatch(other)),
        },
        FieldType::Boolean => match value {
            Value::Boolean(_) => Ok(value),
            Value::Integer(0) => Ok(Value::Boolean(false)),
            Value::Integer(1) => Ok(Value::Boolean(true)),
            ref other => Err(mismatch(other)),
        },
        FieldType::Varchar => {
            let text = match value {
                Value::Text(s) => s,
                Value::Integer(_) | Value::Float(_) | Value::Boolean(_) => value.to_string(),
                Value::Bytes(ref b) => String::from_utf8(b.clone()).map_err(|_| mismatch(&value))?,
                ref other => return Err(mismatch(other)),
            };
            if text.chars().count() > col.length {
                return Err(DriverError::new(
                    codes::ARITH_EXCEPT,
                    format!(
                        "arithmetic exception, numeric overflow, or string truncation: string right truncation (expected length {}, actual {})",
                        col.length,
                        text.chars().count()
                    ),
                ));
            }
            Ok(Value::Text(text))
        }
        FieldType::Blob => match value {
            Value::Blob(id) if blobs.contains(id) => Ok(value),
            Value::Blob(id) => Err(DriverError::new(codes::BAD_SEGSTR_ID, format!("invalid BLOB ID {}", id))),
            Value::Text(s) => Ok(Value::Blob(blobs.insert_bytes(s.as_bytes()))),
            Value::Bytes(b) => Ok(Value::Blob(blobs.insert_bytes(&b))),
            ref other => Err(mismatch(other)),
        },
    }
}

fn meta_error(detail: impl std::fmt::Display) -> DriverError {
    DriverError::new(codes::NO_META_UPDATE, format!("unsuccessful metadata update\n{}", detail))
}

fn relation_error(name: &str) -> DriverError {
    DriverError::new(
        codes::DSQL_RELATION_ERR,
        format!("Dynamic SQL Error\nSQL error code = -204\nTable unknown\n{}", name),
    )
}

pub fn generator_error(name: &str) -> DriverError {
    DriverError::new(codes::GEN_NOT_FOUND, format!("generator {} is not defined", name))
}

fn arith_error(detail: impl std::fmt::Display) -> DriverError {
    DriverError::new(codes::ARITH_EXCEPT, format!("arithmetic exception: {}", detail))
}

fn type_error(op: &str, v: &Value) -> DriverError {
    DriverError::new(codes::DSQL_ERROR, format!("{} cannot be applied to {}", op, v.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::sql::parse;

    struct Fixture {
        tables: Tables,
        touched: HashSet<String>,
        generators: BTreeMap<String, i64>,
        blobs: BlobStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tables: Tables::new(),
                touched: HashSet::new(),
                generators: BTreeMap::new(),
                blobs: BlobStore::default(),
            }
        }

        fn exec(&mut self, sql: &str, args: &[Value]) -> DriverResult<Outcome> {
            let parsed = parse(sql)?;
            let mut scope = Scope {
                tables: &mut self.tables,
                touched: &mut self.touched,
                generators: &mut self.generators,
                blobs: &mut self.blobs,
                read_only: None,
            };
            run(&parsed.command, args, &mut scope)
        }

        fn rows(&mut self, sql: &str, args: &[Value]) -> Vec<Vec<Value>> {
            match self.exec(sql, args).unwrap() {
                Outcome::Rows { rows, .. } => rows,
                other => panic!("expected rows, got {:?}", other),
            }
        }
    }

    fn seeded() -> Fixture {
        let mut f = Fixture::new();
        f.exec("CREATE TABLE users (id INTEGER NOT NULL, name VARCHAR(10), age INTEGER)", &[])
            .unwrap();
        f.exec(
            "INSERT INTO users VALUES (1, 'Alice', 30), (2, 'Bob', 25), (3, 'Carol', NULL)",
            &[],
        )
        .unwrap();
        f
    }

    #[test]
    fn test_insert_reports_affected_rows() {
        let mut f = seeded();
        let outcome = f.exec("INSERT INTO users (id, name) VALUES (?, ?)", &[4.into(), "Dave".into()]).unwrap();
        assert!(matches!(outcome, Outcome::Affected(1)));
        assert!(f.touched.contains("USERS"));
        assert_eq!(f.rows("SELECT age FROM users WHERE id = 4", &[]), vec![vec![Value::Null]]);
    }

    #[test]
    fn test_where_and_order_by() {
        let mut f = seeded();
        let rows = f.rows("SELECT name FROM users WHERE age IS NOT NULL ORDER BY age", &[]);
        assert_eq!(rows, vec![vec![Value::from("Bob")], vec![Value::from("Alice")]]);

        let rows = f.rows("SELECT id FROM users ORDER BY id DESC", &[]);
        assert_eq!(rows[0], vec![Value::Integer(3)]);
    }

    #[test]
    fn test_null_comparison_is_not_true() {
        let mut f = seeded();
        assert_eq!(f.rows("SELECT id FROM users WHERE age > 0 OR age < 0", &[]).len(), 2);
    }

    #[test]
    fn test_update_and_delete() {
        let mut f = seeded();
        assert!(matches!(
            f.exec("UPDATE users SET age = age + 1 WHERE id = ?", &[1.into()]).unwrap(),
            Outcome::Affected(1)
        ));
        assert_eq!(f.rows("SELECT age FROM users WHERE id = 1", &[]), vec![vec![Value::Integer(31)]]);

        assert!(matches!(
            f.exec("DELETE FROM users WHERE age IS NULL", &[]).unwrap(),
            Outcome::Affected(1)
        ));
        assert_eq!(f.rows("SELECT COUNT(*) FROM users", &[]), vec![vec![Value::Integer(2)]]);
    }

    #[test]
    fn test_constraints_and_truncation() {
        let mut f = seeded();
        let err = f.exec("INSERT INTO users (name) VALUES ('x')", &[]).unwrap_err();
        assert_eq!(err.code, Some(codes::NOT_VALID));

        let err = f.exec("INSERT INTO users VALUES (9, 'much too long', 1)", &[]).unwrap_err();
        assert_eq!(err.code, Some(codes::ARITH_EXCEPT));

        let err = f.exec("SELECT * FROM nowhere", &[]).unwrap_err();
        assert_eq!(err.code, Some(codes::DSQL_RELATION_ERR));
    }

    #[test]
    fn test_blob_column_stores_inline_data() {
        let mut f = Fixture::new();
        f.exec("CREATE TABLE docs (id INTEGER, body BLOB)", &[]).unwrap();
        f.exec("INSERT INTO docs VALUES (1, ?)", &[Value::Bytes(b"payload".to_vec())]).unwrap();

        let rows = f.rows("SELECT body FROM docs", &[]);
        let id = rows[0][0].as_blob_id().unwrap();
        assert_eq!(f.blobs.read(id).unwrap(), b"payload");
    }

    #[test]
    fn test_read_only_scope_rejects_writes() {
        let mut f = seeded();
        let parsed = parse("DELETE FROM users").unwrap();
        let mut scope = Scope {
            tables: &mut f.tables,
            touched: &mut f.touched,
            generators: &mut f.generators,
            blobs: &mut f.blobs,
            read_only: Some(DriverError::new(codes::READ_ONLY_TRANS, "read-only")),
        };
        let err = run(&parsed.command, &[], &mut scope).unwrap_err();
        assert_eq!(err.code, Some(codes::READ_ONLY_TRANS));
    }

    #[test]
    fn test_select_without_table() {
        let mut f = Fixture::new();
        assert_eq!(f.rows("SELECT 1 + 2 FROM RDB$DATABASE", &[]), vec![vec![Value::Integer(3)]]);
    }

    #[test]
    fn test_describe_params() {
        let f = seeded();
        let parsed = parse("INSERT INTO users (name, id) VALUES (?, ?)").unwrap();
        let params = describe_params(&parsed.command, parsed.params, &f.tables);
        assert_eq!(params[0].field_type, FieldType::Varchar);
        assert_eq!(params[0].length, 10);
        assert_eq!(params[1].field_type, FieldType::Integer);
        assert_eq!(params[1].relation, "USERS");
    }
}
