// Statements
// Every operation the generator produces is one of these. A statement renders
// to CQL text (which is also its prepared-statement cache key) plus the list
// of values bound to its `?` markers, and the in-process store executes the
// structured form directly.

use crate::storage::{ColumnSpec, SortOrder, TableSpec, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Replication settings of a keyspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replication {
    pub class: String,
    pub factors: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateKeyspace {
        name: String,
        replication: Replication,
    },
    AlterKeyspace {
        name: String,
        replication: Replication,
    },
    DropKeyspace {
        name: String,
    },
    CreateTable {
        spec: TableSpec,
        if_not_exists: bool,
    },
    AddColumn {
        table: String,
        column: ColumnSpec,
    },
    /// Upsert: writes the given columns, the key columns must all be present
    Insert {
        table: String,
        values: Vec<(String, Value)>,
    },
    /// Removes one row (full key) or a whole partition (partition key only)
    Delete {
        table: String,
        key: Vec<(String, Value)>,
    },
    Select(Select),
}

/// What a select returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    All,
    Columns(Vec<String>),
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl RangeOp {
    fn symbol(&self) -> &'static str {
        match self {
            RangeOp::Gt => ">",
            RangeOp::Gte => ">=",
            RangeOp::Lt => "<",
            RangeOp::Lte => "<=",
        }
    }

    pub fn accepts(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            RangeOp::Gt => ordering == Greater,
            RangeOp::Gte => ordering != Less,
            RangeOp::Lt => ordering == Less,
            RangeOp::Lte => ordering != Greater,
        }
    }
}

/// A WHERE predicate on one column
#[derive(Debug, Clone, PartialEq)]
pub enum Restriction {
    Eq(String, Value),
    In(String, Vec<Value>),
    Range {
        column: String,
        op: RangeOp,
        value: Value,
    },
}

impl Restriction {
    pub fn column(&self) -> &str {
        match self {
            Restriction::Eq(column, _)
            | Restriction::In(column, _)
            | Restriction::Range { column, .. } => column,
        }
    }
}

/// Exclusive lower bound of a token scan
#[derive(Debug, Clone, PartialEq)]
pub enum TokenBound {
    Token(i64),
    /// The token of this partition key
    OfKey(Vec<Value>),
}

/// `token(partition key) > lower AND token(partition key) <= upper`
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRestriction {
    pub lower: Option<TokenBound>,
    pub upper: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    pub projection: Projection,
    /// Also return the partition token in a `token` column
    pub with_token: bool,
    /// Partition key columns named inside `token(...)`
    pub token_columns: Vec<String>,
    pub restrictions: Vec<Restriction>,
    pub token: Option<TokenRestriction>,
    pub order: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

/// Name of the extra column carrying the partition token
pub const TOKEN_COLUMN: &str = "token";

impl Select {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            projection: Projection::All,
            with_token: false,
            token_columns: Vec::new(),
            restrictions: Vec::new(),
            token: None,
            order: None,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.projection = Projection::Columns(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn count(mut self) -> Self {
        self.projection = Projection::Count;
        self
    }

    pub fn with_token(mut self, partition_key: &[String]) -> Self {
        self.with_token = true;
        self.token_columns = partition_key.to_vec();
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: Value) -> Self {
        self.restrictions.push(Restriction::Eq(column.into(), value));
        self
    }

    pub fn any_of(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.restrictions.push(Restriction::In(column.into(), values));
        self
    }

    pub fn range(mut self, column: impl Into<String>, op: RangeOp, value: Value) -> Self {
        self.restrictions.push(Restriction::Range {
            column: column.into(),
            op,
            value,
        });
        self
    }

    pub fn token_range(
        mut self,
        partition_key: &[String],
        lower: Option<TokenBound>,
        upper: Option<i64>,
    ) -> Self {
        self.token_columns = partition_key.to_vec();
        self.token = Some(TokenRestriction { lower, upper });
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.order = Some((column.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(self) -> Statement {
        Statement::Select(self)
    }
}

impl Statement {
    /// DML can be prepared once and re-bound; DDL always runs as plain text
    pub fn is_preparable(&self) -> bool {
        matches!(
            self,
            Statement::Insert { .. } | Statement::Delete { .. } | Statement::Select(_)
        )
    }

    /// The table a DML or table DDL statement targets
    pub fn table(&self) -> Option<&str> {
        match self {
            Statement::CreateTable { spec, .. } => Some(&spec.name),
            Statement::AddColumn { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Delete { table, .. } => Some(table),
            Statement::Select(select) => Some(&select.table),
            _ => None,
        }
    }

    /// CQL text with `?` markers; identical shapes render identically
    pub fn cql(&self) -> String {
        self.to_string()
    }

    /// Values bound to the `?` markers, in order
    pub fn values(&self) -> Vec<Value> {
        match self {
            Statement::Insert { values, .. } => values.iter().map(|(_, v)| v.clone()).collect(),
            Statement::Delete { key, .. } => key.iter().map(|(_, v)| v.clone()).collect(),
            Statement::Select(select) => {
                let mut bound = Vec::new();
                for restriction in &select.restrictions {
                    match restriction {
                        Restriction::Eq(_, v) | Restriction::Range { value: v, .. } => {
                            bound.push(v.clone())
                        }
                        Restriction::In(_, values) => bound.extend(values.iter().cloned()),
                    }
                }
                if let Some(token) = &select.token {
                    match &token.lower {
                        Some(TokenBound::Token(t)) => bound.push(Value::BigInt(*t)),
                        Some(TokenBound::OfKey(key)) => bound.extend(key.iter().cloned()),
                        None => {}
                    }
                    if let Some(upper) = token.upper {
                        bound.push(Value::BigInt(upper));
                    }
                }
                if let Some(limit) = select.limit {
                    bound.push(Value::BigInt(limit as i64));
                }
                bound
            }
            _ => Vec::new(),
        }
    }
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quoted_list<'a>(names: impl IntoIterator<Item = &'a String>) -> String {
    names
        .into_iter()
        .map(|n| quoted(n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn markers(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl fmt::Display for Replication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ 'class' : '{}'", self.class)?;
        for (dc, factor) in &self.factors {
            write!(f, ", '{dc}' : {factor}")?;
        }
        write!(f, " }}")
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::CreateKeyspace { name, replication } => {
                write!(f, "CREATE KEYSPACE {name} WITH replication = {replication};")
            }
            Statement::AlterKeyspace { name, replication } => {
                write!(f, "ALTER KEYSPACE {name} WITH replication = {replication};")
            }
            Statement::DropKeyspace { name } => write!(f, "DROP KEYSPACE {name};"),
            Statement::CreateTable {
                spec,
                if_not_exists,
            } => {
                write!(f, "CREATE TABLE ")?;
                if *if_not_exists {
                    write!(f, "IF NOT EXISTS ")?;
                }
                write!(f, "{} (", quoted(&spec.name))?;
                for column in &spec.columns {
                    write!(f, "{} {}, ", quoted(&column.name), column.data_type)?;
                }
                write!(f, "PRIMARY KEY (({})", quoted_list(&spec.partition_key))?;
                if !spec.clustering_key.is_empty() {
                    write!(f, ", {}", quoted_list(&spec.clustering_key))?;
                }
                write!(f, "))")?;
                if let Some(first) = spec.clustering_key.first() {
                    write!(
                        f,
                        " WITH CLUSTERING ORDER BY ({} {})",
                        quoted(first),
                        spec.clustering_order
                    )?;
                }
                write!(f, ";")
            }
            Statement::AddColumn { table, column } => write!(
                f,
                "ALTER TABLE {} ADD {} {};",
                quoted(table),
                quoted(&column.name),
                column.data_type
            ),
            Statement::Insert { table, values } => write!(
                f,
                "INSERT INTO {} ({}) VALUES ({});",
                quoted(table),
                quoted_list(values.iter().map(|(c, _)| c)),
                markers(values.len())
            ),
            Statement::Delete { table, key } => {
                write!(f, "DELETE FROM {}", quoted(table))?;
                for (i, (column, _)) in key.iter().enumerate() {
                    let joiner = if i == 0 { " WHERE" } else { " AND" };
                    write!(f, "{joiner} {} = ?", quoted(column))?;
                }
                write!(f, ";")
            }
            Statement::Select(select) => write!(f, "{select}"),
        }
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token_of = format!("token({})", quoted_list(&self.token_columns));
        write!(f, "SELECT ")?;
        match &self.projection {
            Projection::All => write!(f, "*")?,
            Projection::Columns(columns) => write!(f, "{}", quoted_list(columns))?,
            Projection::Count => write!(f, "COUNT(*)")?,
        }
        if self.with_token {
            write!(f, ", {token_of}")?;
        }
        write!(f, " FROM {}", quoted(&self.table))?;

        let mut clauses = Vec::new();
        for restriction in &self.restrictions {
            clauses.push(match restriction {
                Restriction::Eq(column, _) => format!("{} = ?", quoted(column)),
                Restriction::In(column, values) => {
                    format!("{} IN ({})", quoted(column), markers(values.len()))
                }
                Restriction::Range { column, op, .. } => {
                    format!("{} {} ?", quoted(column), op.symbol())
                }
            });
        }
        if let Some(token) = &self.token {
            match &token.lower {
                Some(TokenBound::Token(_)) => clauses.push(format!("{token_of} > ?")),
                Some(TokenBound::OfKey(key)) => {
                    clauses.push(format!("{token_of} > token({})", markers(key.len())))
                }
                None => {}
            }
            if token.upper.is_some() {
                clauses.push(format!("{token_of} <= ?"));
            }
        }
        if !clauses.is_empty() {
            write!(f, " WHERE {}", clauses.join(" AND "))?;
        }
        if let Some((column, order)) = &self.order {
            write!(f, " ORDER BY {} {order}", quoted(column))?;
        }
        if self.limit.is_some() {
            write!(f, " LIMIT ?")?;
        }
        write!(f, ";")
    }
}
