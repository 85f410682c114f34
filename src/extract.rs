//! Best-effort interpretation of `XLogData` payloads.
//!
//! The built-in `test_decoding` output plugin emits lines such as
//! `table public.users: DELETE: id[integer]:'123'`. [`TestDecodingExtractor`]
//! picks the schema, table and operation out of those; transaction markers
//! (`BEGIN 733`, `COMMIT 733`) do not match and are skipped.
//!
//! Other output plugins need their own [`ChangeExtractor`].

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::bytes::Regex;

use crate::protocol::replication::XLogData;

/// Coarse description of one row change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOperation {
    pub schema: String,
    pub table: String,
    /// Operation keyword as sent by the server (`INSERT`, `UPDATE`, ...).
    pub operation: String,
    /// Server clock of the carrying `XLogData`.
    pub when: DateTime<Utc>,
}

impl TableOperation {
    pub fn kind(&self) -> OperationKind {
        OperationKind::from_keyword(&self.operation)
    }

    /// `schema.table`
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for TableOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{} at {}",
            self.operation,
            self.schema,
            self.table,
            self.when.to_rfc3339()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Truncate,
    Other,
}

impl OperationKind {
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "INSERT" => OperationKind::Insert,
            "UPDATE" => OperationKind::Update,
            "DELETE" => OperationKind::Delete,
            "TRUNCATE" => OperationKind::Truncate,
            _ => OperationKind::Other,
        }
    }
}

/// Turns an `XLogData` payload into a [`TableOperation`], when it describes one.
///
/// A `None` result is the normal outcome for payloads that are not row changes.
pub trait ChangeExtractor: Send + Sync {
    fn extract(&self, xlog: &XLogData) -> Option<TableOperation>;
}

impl<F> ChangeExtractor for F
where
    F: Fn(&XLogData) -> Option<TableOperation> + Send + Sync,
{
    fn extract(&self, xlog: &XLogData) -> Option<TableOperation> {
        self(xlog)
    }
}

static TEST_DECODING_CHANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"table ([A-Za-z0-9_]+)\.([A-Za-z0-9_]+): ([A-Za-z0-9_]+):")
        .expect("test_decoding change pattern is valid")
});

/// Extractor for `test_decoding` text output.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestDecodingExtractor;

impl ChangeExtractor for TestDecodingExtractor {
    fn extract(&self, xlog: &XLogData) -> Option<TableOperation> {
        // Search the raw bytes; only the captured identifiers are decoded.
        let caps = TEST_DECODING_CHANGE.captures(&xlog.data)?;
        let group = |i: usize| {
            caps.get(i)
                .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
        };
        Some(TableOperation {
            schema: group(1)?,
            table: group(2)?,
            operation: group(3)?,
            when: xlog.server_time()?,
        })
    }
}

/// [`TestDecodingExtractor`] as a function.
pub fn extract_table_operation(xlog: &XLogData) -> Option<TableOperation> {
    TestDecodingExtractor.extract(xlog)
}
