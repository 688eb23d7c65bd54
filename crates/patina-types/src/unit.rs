use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use compact_str::CompactString;
use uuid::Uuid;

/// How the compiler should treat a multi-statement script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmtMode {
    /// Exactly one statement is expected.
    Single,
    /// Compile every statement of the script.
    All,
    /// Compile every statement but the first (already handled by error
    /// recovery).
    SkipFirst,
}

/// Transaction status reported by the SQL backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    InTrans,
    InError,
}

/// A single compiled statement, produced by the query compiler.
///
/// Holds everything the frontend needs to run the statement on the SQL
/// backend and to describe its inputs and outputs to the client. Units
/// are cheap to clone: the SQL text and the type descriptors are
/// refcounted.
#[derive(Debug, Clone, Default)]
pub struct QueryUnit {
    /// The backend SQL for this statement. Multi-part units are joined
    /// with `;` before execution.
    pub sql: Vec<Bytes>,

    /// Hash of `sql`, when the compiler wants the backend to keep a
    /// reusable prepared statement for it.
    pub sql_hash: Option<Bytes>,

    pub in_type_id: Uuid,
    pub in_type_data: Bytes,
    pub out_type_id: Uuid,
    pub out_type_data: Bytes,

    pub has_result: bool,
    pub singleton_result: bool,
    pub cacheable: bool,

    /// Set when this unit opens an explicit transaction.
    pub tx_id: Option<u64>,
    pub tx_commit: bool,
    pub tx_rollback: bool,
    pub tx_savepoint_rollback: bool,

    /// Module alias changes this unit applies when it succeeds.
    pub modaliases: Option<HashMap<CompactString, CompactString>>,
    /// Session config changes this unit applies when it succeeds.
    pub config_vals: Option<HashMap<CompactString, CompactString>>,
}

impl QueryUnit {
    /// Whether this unit may run while the current transaction is in
    /// the aborted state.
    pub fn rolls_back(&self) -> bool {
        self.tx_rollback || self.tx_savepoint_rollback
    }

    pub fn joined_sql(&self) -> Bytes {
        if self.sql.len() == 1 {
            return self.sql[0].clone();
        }
        let mut out = BytesMut::new();
        for (i, part) in self.sql.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(b";");
            }
            out.extend_from_slice(part);
        }
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joined_sql_single_part() {
        let unit = QueryUnit {
            sql: vec![Bytes::from_static(b"SELECT 1")],
            ..Default::default()
        };
        assert_eq!(unit.joined_sql(), Bytes::from_static(b"SELECT 1"));
    }

    #[test]
    fn joined_sql_joins_with_semicolons() {
        let unit = QueryUnit {
            sql: vec![
                Bytes::from_static(b"SET search_path TO 'x'"),
                Bytes::from_static(b"SELECT 1"),
            ],
            ..Default::default()
        };
        assert_eq!(
            unit.joined_sql(),
            Bytes::from_static(b"SET search_path TO 'x';SELECT 1")
        );
    }
}
