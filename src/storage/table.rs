// Table implementation
// A table is a map of partitions ordered by token. Each partition holds its
// rows ordered by clustering key, so reads inside one partition come back in
// clustering order and full scans come back in token order.

use super::page::{token_of, Token};
use super::session::SessionError;
use super::{ColumnSpec, Row, SortOrder, TableSpec, Value};
use crate::query::statement::{Projection, Restriction, Select, TokenBound, TOKEN_COLUMN};
use std::collections::BTreeMap;
use std::ops::Bound;

type PartitionKey = (Token, Vec<Value>);
type Partition = BTreeMap<Vec<Value>, Row>;

fn invalid(msg: impl Into<String>) -> SessionError {
    SessionError::InvalidQuery(msg.into())
}

/// One table of the in-process store
#[derive(Debug, Clone)]
pub struct Table {
    spec: TableSpec,
    partitions: BTreeMap<PartitionKey, Partition>,
}

impl Table {
    pub fn new(spec: TableSpec) -> Self {
        Self {
            spec,
            partitions: BTreeMap::new(),
        }
    }

    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn row_count(&self) -> usize {
        self.partitions.values().map(BTreeMap::len).sum()
    }

    pub fn add_column(&mut self, column: ColumnSpec) -> Result<(), SessionError> {
        if self.spec.column(&column.name).is_some() {
            return Err(invalid(format!(
                "column {} already exists in {}",
                column.name, self.spec.name
            )));
        }
        self.spec.columns.push(column);
        Ok(())
    }

    /// Write the given columns into the row named by its key columns
    ///
    /// Columns not mentioned keep their previous value; a null value removes
    /// the column from the row.
    pub fn upsert(&mut self, values: &[(String, Value)]) -> Result<(), SessionError> {
        let mut typed = BTreeMap::new();
        for (name, value) in values {
            let column = self
                .spec
                .column(name)
                .ok_or_else(|| invalid(format!("undefined column {name} in {}", self.spec.name)))?;
            let value = value.coerce(&column.data_type).ok_or_else(|| {
                invalid(format!(
                    "invalid value {value} for column {name} of type {}",
                    column.data_type
                ))
            })?;
            typed.insert(name.clone(), value);
        }

        let partition_key = self.key_values(&self.spec.partition_key, &typed)?;
        let clustering_key = self.key_values(&self.spec.clustering_key, &typed)?;
        let token = token_of(&partition_key);

        let row = self
            .partitions
            .entry((token, partition_key))
            .or_default()
            .entry(clustering_key)
            .or_default();
        for (name, value) in typed {
            if value.is_null() {
                row.remove(&name);
            } else {
                row.insert(name, value);
            }
        }
        Ok(())
    }

    /// Remove one row (full primary key) or a whole partition (partition key only)
    pub fn delete(&mut self, key: &[(String, Value)]) -> Result<(), SessionError> {
        let given: BTreeMap<String, Value> = key.iter().cloned().collect();
        let partition_key = self.key_values(&self.spec.partition_key, &given)?;
        let token = token_of(&partition_key);
        let slot = (token, partition_key);

        if given.len() == self.spec.partition_key.len() {
            self.partitions.remove(&slot);
            return Ok(());
        }

        let clustering_key = self.key_values(&self.spec.clustering_key, &given)?;
        if given.len() != self.spec.partition_key.len() + self.spec.clustering_key.len() {
            return Err(invalid(format!(
                "delete on {} may only name key columns",
                self.spec.name
            )));
        }
        if let Some(partition) = self.partitions.get_mut(&slot) {
            partition.remove(&clustering_key);
            if partition.is_empty() {
                self.partitions.remove(&slot);
            }
        }
        Ok(())
    }

    fn key_values(
        &self,
        columns: &[String],
        values: &BTreeMap<String, Value>,
    ) -> Result<Vec<Value>, SessionError> {
        columns
            .iter()
            .map(|name| match values.get(name) {
                Some(value) if !value.is_null() => Ok(value.clone()),
                _ => Err(invalid(format!(
                    "missing key column {name} for {}",
                    self.spec.name
                ))),
            })
            .collect()
    }

    pub fn select(&self, select: &Select) -> Result<Vec<Row>, SessionError> {
        if let Projection::Columns(columns) = &select.projection {
            for column in columns {
                if self.spec.column(column).is_none() {
                    return Err(invalid(format!("undefined column {column} in {}", self.spec.name)));
                }
            }
        }

        let mut partition_values: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        let mut clustering: Vec<(usize, &Restriction)> = Vec::new();
        for restriction in &select.restrictions {
            let column = restriction.column();
            if self.spec.partition_key.iter().any(|k| k == column) {
                let values = match restriction {
                    Restriction::Eq(_, v) => vec![v.clone()],
                    Restriction::In(_, vs) => vs.clone(),
                    Restriction::Range { .. } => {
                        return Err(invalid(format!(
                            "only equality is supported on partition key column {column}"
                        )))
                    }
                };
                partition_values.insert(column, values);
            } else if let Some(pos) = self.spec.clustering_key.iter().position(|k| k == column) {
                clustering.push((pos, restriction));
            } else {
                return Err(invalid(format!(
                    "cannot restrict non-key column {column} of {}",
                    self.spec.name
                )));
            }
        }

        let reverse = match &select.order {
            Some((column, order)) => {
                if self.spec.clustering_key.first() != Some(column) {
                    return Err(invalid(format!("cannot order {} by {column}", self.spec.name)));
                }
                *order != self.spec.clustering_order
            }
            None => false,
        };
        let descending = (self.spec.clustering_order == SortOrder::Desc) != reverse;

        let partitions: Vec<(&PartitionKey, &Partition)> = if partition_values.is_empty() {
            self.scan_partitions(select)
        } else if partition_values.len() == self.spec.partition_key.len() {
            let candidates = self
                .spec
                .partition_key
                .iter()
                .map(|k| partition_values.get(k.as_str()).cloned().unwrap_or_default())
                .collect::<Vec<_>>();
            let mut found = Vec::new();
            for key in cartesian(&candidates) {
                let slot = (token_of(&key), key);
                if let Some((slot, partition)) = self.partitions.get_key_value(&slot) {
                    found.push((slot, partition));
                }
            }
            found
        } else {
            return Err(invalid(format!(
                "partition key of {} must be fully restricted",
                self.spec.name
            )));
        };

        let limit = select.limit.unwrap_or(usize::MAX);
        let mut rows = Vec::new();
        'partitions: for ((token, _), partition) in partitions {
            let ordered: Box<dyn Iterator<Item = (&Vec<Value>, &Row)>> = if descending {
                Box::new(partition.iter().rev())
            } else {
                Box::new(partition.iter())
            };
            for (clustering_key, row) in ordered {
                let matches = clustering.iter().all(|(pos, restriction)| {
                    clustering_matches(&clustering_key[*pos], restriction)
                });
                if !matches {
                    continue;
                }
                if rows.len() >= limit {
                    break 'partitions;
                }
                rows.push(self.project(row, select, *token));
            }
        }

        if select.projection == Projection::Count {
            let mut count = Row::new();
            count.insert("count".to_string(), Value::BigInt(rows.len() as i64));
            return Ok(vec![count]);
        }
        Ok(rows)
    }

    fn scan_partitions(&self, select: &Select) -> Vec<(&PartitionKey, &Partition)> {
        let (lower, upper) = match &select.token {
            Some(restriction) => {
                let lower = match &restriction.lower {
                    Some(TokenBound::Token(t)) => Some(*t),
                    Some(TokenBound::OfKey(key)) => Some(token_of(key)),
                    None => None,
                };
                (lower, restriction.upper)
            }
            None => (None, None),
        };
        let start = match lower {
            Some(i64::MAX) => return Vec::new(),
            Some(t) => Bound::Included((t + 1, Vec::new())),
            None => Bound::Unbounded,
        };
        self.partitions
            .range((start, Bound::Unbounded))
            .take_while(|((token, _), _)| upper.map_or(true, |u| *token <= u))
            .collect()
    }

    fn project(&self, row: &Row, select: &Select, token: Token) -> Row {
        let mut out = match &select.projection {
            Projection::Columns(columns) => columns
                .iter()
                .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                .collect(),
            _ => row.clone(),
        };
        if select.with_token {
            out.insert(TOKEN_COLUMN.to_string(), Value::BigInt(token));
        }
        out
    }
}

fn clustering_matches(value: &Value, restriction: &Restriction) -> bool {
    match restriction {
        Restriction::Eq(_, v) => value == v,
        Restriction::In(_, vs) => vs.contains(value),
        Restriction::Range { op, value: bound, .. } => op.accepts(value.cmp(bound)),
    }
}

fn cartesian(columns: &[Vec<Value>]) -> Vec<Vec<Value>> {
    let mut keys: Vec<Vec<Value>> = vec![Vec::new()];
    for candidates in columns {
        keys = keys
            .into_iter()
            .flat_map(|prefix| {
                candidates.iter().map(move |v| {
                    let mut key = prefix.clone();
                    key.push(v.clone());
                    key
                })
            })
            .collect();
    }
    keys
}
