//! Per-connection view of a database.
//!
//! Tracks the transaction state mirrored from the backend SQL
//! connection, the session's module aliases and configuration, and the
//! compiled-query cache. The view never talks to the backend itself:
//! the connection drives it through `start`/`on_success`/`on_error` and
//! the recovery entry points.

use std::collections::HashMap;

use bytes::Bytes;
use compact_str::CompactString;
use tracing::debug;

use crate::error::ServerError;
use crate::unit::QueryUnit;

pub type ModAliases = HashMap<CompactString, CompactString>;
pub type Settings = HashMap<CompactString, CompactString>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    eql: Bytes,
    json_mode: bool,
}

#[derive(Debug, Default)]
enum TxState {
    #[default]
    None,
    Open {
        id: u64,
        error: bool,
    },
}

#[derive(Debug)]
pub struct DbView {
    dbname: CompactString,
    user: CompactString,
    dbver: i64,

    modaliases: ModAliases,
    config: Settings,
    /// Aliases/config as they were before the open transaction, so a
    /// full rollback can restore them without a backend round trip.
    tx_snapshot: Option<(ModAliases, Settings)>,

    tx: TxState,
    current_savepoint: Option<i64>,

    cache_enabled: bool,
    cache: HashMap<CacheKey, QueryUnit>,
}

impl DbView {
    pub fn new(
        dbname: &str,
        user: &str,
        dbver: i64,
        cache_enabled: bool,
        default_module: CompactString,
    ) -> Self {
        let mut modaliases = ModAliases::new();
        // the empty alias is the default module
        modaliases.insert(CompactString::const_new(""), default_module);
        Self {
            dbname: dbname.into(),
            user: user.into(),
            dbver,
            modaliases,
            config: Settings::new(),
            tx_snapshot: None,
            tx: TxState::None,
            current_savepoint: None,
            cache_enabled,
            cache: HashMap::new(),
        }
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn dbver(&self) -> i64 {
        self.dbver
    }

    pub fn modaliases(&self) -> &ModAliases {
        &self.modaliases
    }

    pub fn config(&self) -> &Settings {
        &self.config
    }

    pub fn in_tx(&self) -> bool {
        matches!(self.tx, TxState::Open { .. })
    }

    pub fn in_tx_error(&self) -> bool {
        matches!(self.tx, TxState::Open { error: true, .. })
    }

    pub fn txid(&self) -> Option<u64> {
        match self.tx {
            TxState::Open { id, .. } => Some(id),
            TxState::None => None,
        }
    }

    pub fn current_savepoint(&self) -> Option<i64> {
        self.current_savepoint
    }

    pub fn tx_aborted_error() -> ServerError {
        ServerError::transaction(
            "current transaction is aborted, commands ignored until end of transaction block",
        )
    }

    /// Called before a unit is sent to the backend.
    pub fn start(&self, unit: &QueryUnit) -> Result<(), ServerError> {
        if self.in_tx_error() && !unit.rolls_back() {
            return Err(Self::tx_aborted_error());
        }
        Ok(())
    }

    /// Applies a unit's session side effects after the backend ran it
    /// successfully.
    pub fn on_success(&mut self, unit: &QueryUnit) {
        if let Some(id) = unit.tx_id {
            self.tx_snapshot = Some((self.modaliases.clone(), self.config.clone()));
            self.tx = TxState::Open { id, error: false };
        }
        if let Some(aliases) = &unit.modaliases {
            self.modaliases
                .extend(aliases.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(vals) = &unit.config_vals {
            self.config
                .extend(vals.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if unit.tx_commit {
            self.tx = TxState::None;
            self.tx_snapshot = None;
            self.current_savepoint = None;
        } else if unit.tx_rollback {
            self.tx = TxState::None;
            self.current_savepoint = None;
            if let Some((aliases, config)) = self.tx_snapshot.take() {
                self.modaliases = aliases;
                self.config = config;
            }
        }
    }

    /// Marks the open transaction as aborted after a failed unit.
    pub fn on_error(&mut self, _unit: &QueryUnit) {
        self.tx_error();
    }

    pub fn tx_error(&mut self) {
        if let TxState::Open { error, .. } = &mut self.tx {
            *error = true;
        }
    }

    /// Forgets the open transaction entirely. Aliases and config are
    /// left as-is; callers recover them from the backend's state
    /// tables.
    pub fn abort_tx(&mut self) {
        self.tx = TxState::None;
        self.tx_snapshot = None;
        self.current_savepoint = None;
    }

    /// Applies the state reconstructed from the backend after a
    /// savepoint rollback. The transaction stays open and leaves the
    /// error state.
    pub fn rollback_tx_to_savepoint(
        &mut self,
        sp_id: i64,
        aliases: ModAliases,
        config: Settings,
    ) {
        debug!(sp_id, "rolled back to savepoint");
        if let TxState::Open { error, .. } = &mut self.tx {
            *error = false;
        }
        self.current_savepoint = Some(sp_id);
        self.modaliases = aliases;
        self.config = config;
    }

    /// Applies the state reconstructed from the backend outside of a
    /// transaction.
    pub fn recover_aliases_and_config(&mut self, aliases: ModAliases, config: Settings) {
        self.tx = TxState::None;
        self.tx_snapshot = None;
        self.current_savepoint = None;
        self.modaliases = aliases;
        self.config = config;
    }

    pub fn lookup_compiled(&self, eql: &[u8], json_mode: bool) -> Option<QueryUnit> {
        if !self.cache_enabled {
            return None;
        }
        let key = CacheKey {
            eql: Bytes::copy_from_slice(eql),
            json_mode,
        };
        self.cache.get(&key).cloned()
    }

    /// Remembers a compiled unit. Only units the compiler marked
    /// cacheable are kept, and callers must have prepared the unit's
    /// SQL on the backend first.
    pub fn cache_compiled(&mut self, eql: Bytes, json_mode: bool, unit: &QueryUnit) {
        if !self.cache_enabled || !unit.cacheable {
            return;
        }
        self.cache
            .insert(CacheKey { eql, json_mode }, unit.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> DbView {
        DbView::new("db", "user", 1, true, CompactString::const_new("default"))
    }

    fn tx_unit(id: u64) -> QueryUnit {
        QueryUnit {
            tx_id: Some(id),
            ..Default::default()
        }
    }

    #[test]
    fn default_module_alias() {
        let view = view();
        assert_eq!(view.modaliases().get("").unwrap(), "default");
    }

    #[test]
    fn tx_lifecycle() {
        let mut view = view();
        assert!(!view.in_tx());

        view.on_success(&tx_unit(7));
        assert!(view.in_tx());
        assert_eq!(view.txid(), Some(7));
        assert!(!view.in_tx_error());

        view.tx_error();
        assert!(view.in_tx_error());

        let rollback = QueryUnit {
            tx_rollback: true,
            ..Default::default()
        };
        assert!(view.start(&rollback).is_ok());
        view.on_success(&rollback);
        assert!(!view.in_tx());
        assert!(!view.in_tx_error());
    }

    #[test]
    fn start_rejects_non_rollback_in_error_state() {
        let mut view = view();
        view.on_success(&tx_unit(1));
        view.tx_error();

        let select = QueryUnit::default();
        let err = view.start(&select).unwrap_err();
        assert_eq!(err.code, crate::error::codes::TRANSACTION_ERROR);
    }

    #[test]
    fn rollback_restores_pre_tx_state() {
        let mut view = view();
        let set_alias = QueryUnit {
            modaliases: Some(HashMap::from([("m".into(), "other".into())])),
            ..Default::default()
        };
        view.on_success(&set_alias);

        view.on_success(&tx_unit(1));
        let set_in_tx = QueryUnit {
            modaliases: Some(HashMap::from([("m".into(), "third".into())])),
            config_vals: Some(HashMap::from([("opt".into(), "on".into())])),
            ..Default::default()
        };
        view.on_success(&set_in_tx);
        assert_eq!(view.modaliases().get("m").unwrap(), "third");

        let rollback = QueryUnit {
            tx_rollback: true,
            ..Default::default()
        };
        view.on_success(&rollback);
        assert_eq!(view.modaliases().get("m").unwrap(), "other");
        assert!(view.config().get("opt").is_none());
    }

    #[test]
    fn commit_keeps_tx_state() {
        let mut view = view();
        view.on_success(&tx_unit(1));
        let set_in_tx = QueryUnit {
            config_vals: Some(HashMap::from([("opt".into(), "on".into())])),
            ..Default::default()
        };
        view.on_success(&set_in_tx);

        let commit = QueryUnit {
            tx_commit: true,
            ..Default::default()
        };
        view.on_success(&commit);
        assert!(!view.in_tx());
        assert_eq!(view.config().get("opt").unwrap(), "on");
    }

    #[test]
    fn savepoint_rollback_clears_error_but_stays_in_tx() {
        let mut view = view();
        view.on_success(&tx_unit(1));
        view.tx_error();

        let aliases = ModAliases::from([("".into(), "default".into())]);
        view.rollback_tx_to_savepoint(3, aliases.clone(), Settings::new());
        assert!(view.in_tx());
        assert!(!view.in_tx_error());
        assert_eq!(view.current_savepoint(), Some(3));
        assert_eq!(view.modaliases(), &aliases);
    }

    #[test]
    fn cache_only_keeps_cacheable_units() {
        let mut view = view();
        let cacheable = QueryUnit {
            cacheable: true,
            ..Default::default()
        };
        let transient = QueryUnit::default();

        view.cache_compiled(Bytes::from_static(b"SELECT 1"), false, &cacheable);
        view.cache_compiled(Bytes::from_static(b"SELECT 2"), false, &transient);

        assert!(view.lookup_compiled(b"SELECT 1", false).is_some());
        assert!(view.lookup_compiled(b"SELECT 1", true).is_none());
        assert!(view.lookup_compiled(b"SELECT 2", false).is_none());
    }

    #[test]
    fn cache_disabled() {
        let mut view = DbView::new("db", "user", 1, false, "default".into());
        let cacheable = QueryUnit {
            cacheable: true,
            ..Default::default()
        };
        view.cache_compiled(Bytes::from_static(b"SELECT 1"), false, &cacheable);
        assert!(view.lookup_compiled(b"SELECT 1", false).is_none());
    }
}
