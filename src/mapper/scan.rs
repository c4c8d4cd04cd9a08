// Full table scans
// A scan splits the token ring into ranges and reads each range in bounded
// pages, so the table is never loaded at once. The cursor records the range
// and the last token handed out; a scan can stop at any point and resume
// from its cursor later.

use super::ObjectMapper;
use crate::error::Result;
use crate::query::generator;
use crate::schema::{Object, ObjectDefinition};
use crate::storage::page::{split_ring, Page, Token, TokenRange};
use std::collections::VecDeque;

/// Resumable position of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanCursor {
    /// Index of the token range being read
    pub range_index: usize,
    /// Token of the last object returned from that range
    pub last_token: Option<Token>,
}

/// Lazy iterator over every object of one type
pub struct ObjectScan<'a> {
    mapper: &'a ObjectMapper,
    definition: ObjectDefinition,
    ranges: Vec<TokenRange>,
    page_size: usize,
    cursor: ScanCursor,
    buffer: VecDeque<(Token, Object)>,
    range_exhausted: bool,
    failed: bool,
}

impl<'a> ObjectScan<'a> {
    pub(crate) fn new(
        mapper: &'a ObjectMapper,
        definition: ObjectDefinition,
        range_count: usize,
        page_size: usize,
        cursor: ScanCursor,
    ) -> Self {
        Self {
            mapper,
            definition,
            ranges: split_ring(range_count),
            page_size: page_size.max(1),
            cursor,
            buffer: VecDeque::new(),
            range_exhausted: false,
            failed: false,
        }
    }

    /// Where a new scan would pick up after the objects returned so far
    pub fn cursor(&self) -> ScanCursor {
        self.cursor
    }

    fn fetch(&mut self, range: TokenRange) -> Result<()> {
        let statement = generator::scan_page(
            &self.definition,
            &range,
            self.cursor.last_token,
            self.page_size,
        );
        let rows = self.mapper.executor.execute_sync(&statement)?;
        let page = Page::from_rows(rows, self.page_size);
        self.range_exhausted = page.exhausted;
        self.buffer.extend(page.entries);
        Ok(())
    }
}

impl Iterator for ObjectScan<'_> {
    type Item = Result<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if let Some((token, object)) = self.buffer.pop_front() {
                self.cursor.last_token = Some(token);
                return Some(Ok(object));
            }
            if self.range_exhausted {
                self.cursor = ScanCursor {
                    range_index: self.cursor.range_index + 1,
                    last_token: None,
                };
                self.range_exhausted = false;
            }
            let range = *self.ranges.get(self.cursor.range_index)?;
            if let Err(err) = self.fetch(range) {
                self.failed = true;
                return Some(Err(err));
            }
        }
    }
}
