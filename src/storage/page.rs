// Token ring paging
// Partitions are placed on a ring of 64-bit tokens (SeaHash of the partition
// key). Full scans walk the ring in bounded ranges and bounded pages so a
// whole table is never held in memory at once.

use super::{hash_key, Row, Value};
use crate::query::statement::TOKEN_COLUMN;

pub type Token = i64;

/// Token of a partition key
pub fn token_of(key: &[Value]) -> Token {
    hash_key(key) as Token
}

/// `(start, end]` slice of the ring; a missing start means the ring's beginning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRange {
    pub start: Option<Token>,
    pub end: Token,
}

impl TokenRange {
    pub fn contains(&self, token: Token) -> bool {
        self.start.map_or(true, |s| token > s) && token <= self.end
    }
}

/// Split the whole ring into `count` contiguous ranges
pub fn split_ring(count: usize) -> Vec<TokenRange> {
    let count = count.max(1) as i128;
    let span = (i64::MAX as i128) - (i64::MIN as i128);
    let step = span / count;
    let mut ranges = Vec::with_capacity(count as usize);
    let mut start = None;
    for k in 0..count {
        let end = if k == count - 1 {
            i64::MAX
        } else {
            (i64::MIN as i128 + step * (k + 1)) as i64
        };
        ranges.push(TokenRange { start, end });
        start = Some(end);
    }
    ranges
}

/// One bounded read of a token range
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Rows with the token of the partition each came from
    pub entries: Vec<(Token, Row)>,
    /// True when the range has nothing after this page
    pub exhausted: bool,
}

impl Page {
    /// Build a page from rows that carry a token column
    ///
    /// A page shorter than `page_size` means the range is exhausted. Rows
    /// without a token are dropped.
    pub fn from_rows(rows: Vec<Row>, page_size: usize) -> Self {
        let exhausted = rows.len() < page_size;
        let entries = rows
            .into_iter()
            .filter_map(|mut row| {
                let token = row.remove(TOKEN_COLUMN)?.as_i64()?;
                Some((token, row))
            })
            .collect();
        Self { entries, exhausted }
    }
}
