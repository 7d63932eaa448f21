// ============================================================================
// SQL subset understood by the in-memory driver
// ============================================================================
//
// Statements are parsed with sqlparser and lowered into `Command`. Unquoted
// identifiers are folded to upper case. `?` placeholders are numbered in
// source order, starting at 0.
//
// ============================================================================

use crate::core::{DriverError, DriverResult, FieldType, Value};
use crate::driver::memory::codes;
use crate::driver::memory::storage::ColumnDef;
use sqlparser::ast as sql_ast;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Subtract,
    Multiply,
    Divide,
    Concat,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Value),
    Param(usize),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Negate(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    /// `COUNT(*)`, only valid as the sole select item
    CountAll,
}

impl Expr {
    /// Column directly compared with or assigned from each placeholder.
    pub fn param_columns(&self, out: &mut Vec<(usize, String)>) {
        match self {
            Expr::BinaryOp { left, right, .. } => {
                match (left.as_ref(), right.as_ref()) {
                    (Expr::Column(c), Expr::Param(p)) | (Expr::Param(p), Expr::Column(c)) => {
                        out.push((*p, c.clone()));
                    }
                    _ => {}
                }
                left.param_columns(out);
                right.param_columns(out);
            }
            Expr::Not(e) | Expr::Negate(e) => e.param_columns(out),
            Expr::IsNull { expr, .. } => expr.param_columns(out),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    Expr { expr: Expr, alias: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: Option<String>,
    pub items: Vec<SelectItem>,
    pub filter: Option<Expr>,
    pub order_by: Vec<OrderBy>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateTable {
        name: String,
        columns: Vec<ColumnDef>,
        if_not_exists: bool,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    CreateSequence {
        name: String,
        if_not_exists: bool,
    },
    DropSequence {
        name: String,
        if_exists: bool,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
    },
    Select(Select),
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        filter: Option<Expr>,
    },
    Delete {
        table: String,
        filter: Option<Expr>,
    },
}

impl Command {
    /// Whether the command changes data or metadata.
    pub fn is_write(&self) -> bool {
        !matches!(self, Command::Select(_))
    }
}

/// A parsed statement and its placeholder count.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub command: Command,
    pub params: usize,
}

pub fn parse(sql: &str) -> DriverResult<Parsed> {
    let sql = rewrite_generator_ddl(sql);
    let mut statements = Parser::parse_sql(&GenericDialect {}, &sql)
        .map_err(|e| dsql_error(-104, e.to_string()))?;

    if statements.len() != 1 {
        return Err(dsql_error(
            -104,
            format!("expected a single statement, got {}", statements.len()),
        ));
    }

    let mut lowering = Lowering { params: 0 };
    let command = lowering.statement(statements.remove(0))?;
    Ok(Parsed {
        command,
        params: lowering.params,
    })
}

/// `CREATE/DROP GENERATOR` is the server's spelling of `CREATE/DROP SEQUENCE`.
fn rewrite_generator_ddl(sql: &str) -> String {
    let trimmed = sql.trim();
    let words: Vec<&str> = trimmed.splitn(3, char::is_whitespace).collect();
    match words.as_slice() {
        [verb, kind, rest]
            if (verb.eq_ignore_ascii_case("CREATE") || verb.eq_ignore_ascii_case("DROP"))
                && kind.eq_ignore_ascii_case("GENERATOR") =>
        {
            format!("{} SEQUENCE {}", verb, rest)
        }
        _ => trimmed.to_string(),
    }
}

pub fn dsql_error(sqlcode: i64, detail: impl std::fmt::Display) -> DriverError {
    DriverError::new(
        codes::DSQL_ERROR,
        format!("Dynamic SQL Error\nSQL error code = {}\n{}", sqlcode, detail),
    )
}

fn unsupported(what: impl std::fmt::Display) -> DriverError {
    dsql_error(-104, format!("Feature is not supported: {}", what))
}

/// Upper-cases unquoted identifiers.
fn ident_name(ident: &sql_ast::Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_uppercase()
    }
}

fn object_name(name: &sql_ast::ObjectName) -> DriverResult<String> {
    match name.0.last() {
        Some(sql_ast::ObjectNamePart::Identifier(ident)) => Ok(ident_name(ident)),
        _ => Err(dsql_error(-104, format!("Invalid object name {}", name))),
    }
}

fn table_factor_name(factor: &sql_ast::TableFactor) -> DriverResult<String> {
    match factor {
        sql_ast::TableFactor::Table { name, .. } => object_name(name),
        _ => Err(unsupported("complex table references")),
    }
}

fn column_def(col: &sql_ast::ColumnDef) -> DriverResult<ColumnDef> {
    let (field_type, length) = data_type(&col.data_type)?;
    let nullable = !col
        .options
        .iter()
        .any(|opt| matches!(opt.option, sql_ast::ColumnOption::NotNull));

    Ok(ColumnDef {
        name: ident_name(&col.name),
        field_type,
        length,
        nullable,
    })
}

/// Maps a declared type onto the driver's field types, by type name.
fn data_type(dt: &sql_ast::DataType) -> DriverResult<(FieldType, usize)> {
    let text = dt.to_string().to_uppercase();
    let declared_length = text
        .split_once('(')
        .and_then(|(_, rest)| rest.trim_end_matches(')').split(',').next())
        .and_then(|n| n.trim().parse::<usize>().ok());

    let mapped = if text.starts_with("BIGINT") || text.starts_with("INT8") {
        (FieldType::Integer, 8)
    } else if text.starts_with("INT") || text.starts_with("SMALLINT") {
        (FieldType::Integer, 4)
    } else if ["FLOAT", "DOUBLE", "REAL", "DECIMAL", "NUMERIC"]
        .iter()
        .any(|p| text.starts_with(p))
    {
        (FieldType::Float, 8)
    } else if text.starts_with("BOOL") {
        (FieldType::Boolean, 1)
    } else if ["BLOB", "BYTEA", "BINARY", "VARBINARY", "TEXT"]
        .iter()
        .any(|p| text.starts_with(p))
    {
        (FieldType::Blob, 8)
    } else if ["VARCHAR", "CHAR", "CHARACTER", "STRING"]
        .iter()
        .any(|p| text.starts_with(p))
    {
        (FieldType::Varchar, declared_length.unwrap_or(255))
    } else {
        return Err(dsql_error(-607, format!("Data type unknown: {}", text)));
    };
    Ok(mapped)
}

struct Lowering {
    params: usize,
}

impl Lowering {
    fn statement(&mut self, stmt: sql_ast::Statement) -> DriverResult<Command> {
        match stmt {
            sql_ast::Statement::CreateTable(create) => {
                let columns = create
                    .columns
                    .iter()
                    .map(column_def)
                    .collect::<DriverResult<Vec<_>>>()?;
                if columns.is_empty() {
                    return Err(dsql_error(-104, "CREATE TABLE requires at least one column"));
                }
                Ok(Command::CreateTable {
                    name: object_name(&create.name)?,
                    columns,
                    if_not_exists: create.if_not_exists,
                })
            }
            sql_ast::Statement::CreateSequence {
                name,
                if_not_exists,
                ..
            } => Ok(Command::CreateSequence {
                name: object_name(&name)?,
                if_not_exists,
            }),
            sql_ast::Statement::Drop {
                object_type,
                names,
                if_exists,
                ..
            } => {
                if names.len() != 1 {
                    return Err(unsupported("dropping several objects at once"));
                }
                let name = object_name(&names[0])?;
                match object_type {
                    sql_ast::ObjectType::Table => Ok(Command::DropTable { name, if_exists }),
                    sql_ast::ObjectType::Sequence => Ok(Command::DropSequence { name, if_exists }),
                    other => Err(unsupported(format!("DROP {}", other))),
                }
            }
            sql_ast::Statement::Insert(insert) => self.insert(insert),
            sql_ast::Statement::Query(query) => self.query(*query),
            sql_ast::Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => {
                let table = table_factor_name(&table.relation)?;
                let assignments = assignments
                    .into_iter()
                    .map(|assign| {
                        let column = match &assign.target {
                            sql_ast::AssignmentTarget::ColumnName(name) => object_name(name)?,
                            _ => return Err(unsupported("tuple assignment")),
                        };
                        Ok((column, self.expr(assign.value)?))
                    })
                    .collect::<DriverResult<Vec<_>>>()?;
                let filter = selection.map(|e| self.expr(e)).transpose()?;
                Ok(Command::Update {
                    table,
                    assignments,
                    filter,
                })
            }
            sql_ast::Statement::Delete(delete) => {
                let tables = match &delete.from {
                    sql_ast::FromTable::WithFromKeyword(tables)
                    | sql_ast::FromTable::WithoutKeyword(tables) => tables,
                };
                let table = match tables.as_slice() {
                    [only] => table_factor_name(&only.relation)?,
                    _ => return Err(unsupported("DELETE from several tables")),
                };
                let filter = delete.selection.map(|e| self.expr(e)).transpose()?;
                Ok(Command::Delete { table, filter })
            }
            other => Err(unsupported(format!("statement {}", other))),
        }
    }

    fn insert(&mut self, insert: sql_ast::Insert) -> DriverResult<Command> {
        let table = match &insert.table {
            sql_ast::TableObject::TableName(name) => object_name(name)?,
            _ => return Err(unsupported("INSERT into a table function")),
        };

        let columns = if insert.columns.is_empty() {
            None
        } else {
            Some(insert.columns.iter().map(ident_name).collect())
        };

        let Some(source) = insert.source else {
            return Err(dsql_error(-104, "INSERT requires VALUES"));
        };
        let sql_ast::SetExpr::Values(values) = *source.body else {
            return Err(unsupported("INSERT ... SELECT"));
        };

        let rows = values
            .rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|e| self.expr(e))
                    .collect::<DriverResult<Vec<_>>>()
            })
            .collect::<DriverResult<Vec<_>>>()?;

        Ok(Command::Insert {
            table,
            columns,
            rows,
        })
    }

    fn query(&mut self, query: sql_ast::Query) -> DriverResult<Command> {
        let sql_ast::SetExpr::Select(select) = *query.body else {
            return Err(unsupported("set operations"));
        };

        let table = match select.from.as_slice() {
            [] => None,
            [only] if only.joins.is_empty() => Some(table_factor_name(&only.relation)?),
            _ => return Err(unsupported("joins")),
        };

        let items = select
            .projection
            .into_iter()
            .map(|item| self.select_item(item))
            .collect::<DriverResult<Vec<_>>>()?;

        let filter = select.selection.map(|e| self.expr(e)).transpose()?;

        let mut order_by = Vec::new();
        if let Some(clause) = query.order_by {
            match clause.kind {
                sql_ast::OrderByKind::Expressions(exprs) => {
                    for order in exprs {
                        order_by.push(OrderBy {
                            expr: self.expr(order.expr)?,
                            descending: order.options.asc.map(|asc| !asc).unwrap_or(false),
                        });
                    }
                }
                sql_ast::OrderByKind::All(_) => return Err(unsupported("ORDER BY ALL")),
            }
        }

        if items.iter().any(|i| matches!(i, SelectItem::Expr { expr: Expr::CountAll, .. }))
            && items.len() != 1
        {
            return Err(unsupported("COUNT(*) mixed with other select items"));
        }

        Ok(Command::Select(Select {
            table,
            items,
            filter,
            order_by,
        }))
    }

    fn select_item(&mut self, item: sql_ast::SelectItem) -> DriverResult<SelectItem> {
        match item {
            sql_ast::SelectItem::Wildcard(_) => Ok(SelectItem::Wildcard),
            sql_ast::SelectItem::UnnamedExpr(expr) => {
                let alias = match &expr {
                    sql_ast::Expr::Identifier(ident) => ident_name(ident),
                    sql_ast::Expr::CompoundIdentifier(idents) => {
                        idents.last().map(ident_name).unwrap_or_default()
                    }
                    sql_ast::Expr::Value(_) => "CONSTANT".to_string(),
                    sql_ast::Expr::Function(func) => func.name.to_string().to_uppercase(),
                    other => other.to_string().to_uppercase(),
                };
                Ok(SelectItem::Expr {
                    expr: self.expr(expr)?,
                    alias,
                })
            }
            sql_ast::SelectItem::ExprWithAlias { expr, alias } => Ok(SelectItem::Expr {
                expr: self.expr(expr)?,
                alias: ident_name(&alias),
            }),
            other => Err(unsupported(format!("select item {}", other))),
        }
    }

    fn expr(&mut self, expr: sql_ast::Expr) -> DriverResult<Expr> {
        match expr {
            sql_ast::Expr::Identifier(ident) => Ok(Expr::Column(ident_name(&ident))),
            sql_ast::Expr::CompoundIdentifier(idents) => idents
                .last()
                .map(|i| Expr::Column(ident_name(i)))
                .ok_or_else(|| dsql_error(-104, "empty identifier")),
            sql_ast::Expr::Value(value_with_span) => match value_with_span.value {
                sql_ast::Value::Placeholder(_) => {
                    let index = self.params;
                    self.params += 1;
                    Ok(Expr::Param(index))
                }
                other => Ok(Expr::Literal(literal(&other)?)),
            },
            sql_ast::Expr::Nested(inner) => self.expr(*inner),
            sql_ast::Expr::IsNull(inner) => Ok(Expr::IsNull {
                expr: Box::new(self.expr(*inner)?),
                negated: false,
            }),
            sql_ast::Expr::IsNotNull(inner) => Ok(Expr::IsNull {
                expr: Box::new(self.expr(*inner)?),
                negated: true,
            }),
            sql_ast::Expr::UnaryOp { op, expr } => {
                let inner = Box::new(self.expr(*expr)?);
                match op {
                    sql_ast::UnaryOperator::Not => Ok(Expr::Not(inner)),
                    sql_ast::UnaryOperator::Minus => Ok(Expr::Negate(inner)),
                    sql_ast::UnaryOperator::Plus => Ok(*inner),
                    other => Err(unsupported(format!("operator {}", other))),
                }
            }
            sql_ast::Expr::BinaryOp { left, op, right } => {
                let left = Box::new(self.expr(*left)?);
                let op = binary_op(&op)?;
                let right = Box::new(self.expr(*right)?);
                Ok(Expr::BinaryOp { left, op, right })
            }
            sql_ast::Expr::Function(func) => {
                let is_count_all = func.name.to_string().eq_ignore_ascii_case("COUNT")
                    && matches!(
                        &func.args,
                        sql_ast::FunctionArguments::List(list)
                            if matches!(
                                list.args.as_slice(),
                                [sql_ast::FunctionArg::Unnamed(sql_ast::FunctionArgExpr::Wildcard)]
                            )
                    );
                if is_count_all {
                    Ok(Expr::CountAll)
                } else {
                    Err(unsupported(format!("function {}", func.name)))
                }
            }
            other => Err(unsupported(format!("expression {}", other))),
        }
    }
}

fn literal(value: &sql_ast::Value) -> DriverResult<Value> {
    match value {
        sql_ast::Value::Number(n, _) => n
            .parse::<i64>()
            .map(Value::Integer)
            .or_else(|_| n.parse::<f64>().map(Value::Float))
            .map_err(|_| dsql_error(-104, format!("Invalid number: {}", n))),
        sql_ast::Value::SingleQuotedString(s) => Ok(Value::Text(s.clone())),
        sql_ast::Value::Boolean(b) => Ok(Value::Boolean(*b)),
        sql_ast::Value::Null => Ok(Value::Null),
        other => Err(unsupported(format!("literal {}", other))),
    }
}

fn binary_op(op: &sql_ast::BinaryOperator) -> DriverResult<BinaryOp> {
    use sql_ast::BinaryOperator as SqlOp;

    match op {
        SqlOp::Eq => Ok(BinaryOp::Eq),
        SqlOp::NotEq => Ok(BinaryOp::NotEq),
        SqlOp::Lt => Ok(BinaryOp::Lt),
        SqlOp::LtEq => Ok(BinaryOp::LtEq),
        SqlOp::Gt => Ok(BinaryOp::Gt),
        SqlOp::GtEq => Ok(BinaryOp::GtEq),
        SqlOp::And => Ok(BinaryOp::And),
        SqlOp::Or => Ok(BinaryOp::Or),
        SqlOp::Plus => Ok(BinaryOp::Add),
        SqlOp::Minus => Ok(BinaryOp::Subtract),
        SqlOp::Multiply => Ok(BinaryOp::Multiply),
        SqlOp::Divide => Ok(BinaryOp::Divide),
        SqlOp::StringConcat => Ok(BinaryOp::Concat),
        other => Err(unsupported(format!("operator {}", other))),
    }
}
