use std::sync::Arc;

use rusqlite::{ffi, Connection, OpenFlags};

use crate::checkpoint::{self, CheckpointHook};
use crate::cluster::{Cluster, DatabaseRef};
use crate::config::GatewayConfig;
use crate::error::Error;
use crate::statement::{PreparedStatement, StatementRegistry};
use crate::Result;

/// The single local SQL connection of a gateway, with its statement table
/// and the replication-aware WAL hook installed.
#[derive(Debug)]
pub struct Database {
    id: u32,
    // Statements hold raw cursors into `conn`; field order finalizes them
    // before the connection closes.
    stmts: StatementRegistry,
    conn: Connection,
    handle: DatabaseRef,
    // Owned, but kept raw: the engine reads it from the commit path while
    // this struct is borrowed mutably.
    hook: *mut CheckpointHook,
}

impl Drop for Database {
    fn drop(&mut self) {
        checkpoint::uninstall(&self.conn, self.hook);
    }
}

impl Database {
    pub(crate) fn open(
        config: &GatewayConfig,
        cluster: Arc<dyn Cluster>,
        name: &str,
        flags: u64,
        vfs: Option<&str>,
    ) -> Result<Self> {
        let path = config.data_dir.join(name);
        let flags = open_flags(flags);
        let conn = match vfs.or(config.vfs.as_deref()) {
            Some(vfs) => Connection::open_with_flags_and_vfs(&path, flags, vfs)?,
            None => Connection::open_with_flags(&path, flags)?,
        };
        conn.pragma_update(None, "page_size", config.page_size)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        tracing::trace!(
            path = %path.display(),
            replication = config.wal_replication.as_deref().unwrap_or("none"),
            "opened gateway database"
        );

        // WAL truncation is coordinated across the cluster; the engine must
        // not checkpoint on its own.
        unsafe { ffi::sqlite3_wal_autocheckpoint(conn.handle(), 0) };

        let handle = DatabaseRef {
            id: 0,
            path: Arc::new(path),
        };
        let hook = checkpoint::install(&conn, cluster, handle.clone(), config.checkpoint_threshold)?;

        Ok(Self {
            id: 0,
            stmts: StatementRegistry::default(),
            conn,
            handle,
            hook,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handle(&self) -> &DatabaseRef {
        &self.handle
    }

    fn raw(&self) -> *mut ffi::sqlite3 {
        unsafe { self.conn.handle() }
    }

    /// Compiles the first statement of `sql` and registers it. Returns the
    /// statement id and its bind placeholder count.
    pub fn prepare(&mut self, sql: &str) -> Result<(u32, u64)> {
        let (raw, tail) = PreparedStatement::compile(self.raw(), sql)?;
        let raw = raw.ok_or(Error::EmptyQuery)?;
        let id = self.stmts.vacant_id();
        let stmt = PreparedStatement::new(id, self.raw(), raw, tail);
        let params = stmt.parameter_count();
        self.stmts.insert(stmt);
        Ok((id, params))
    }

    pub fn stmt_mut(&mut self, id: u32) -> Result<&mut PreparedStatement> {
        self.stmts.get_mut(id).ok_or(Error::NoSuchStmt(id))
    }

    pub fn finalize(&mut self, id: u32) -> Result<()> {
        self.stmts
            .remove(id)
            .ok_or(Error::NoSuchStmt(id))?
            .finalize()
    }

    /// Compiles one statement without registering it; used by the one-shot
    /// SQL handlers. `None` when the text contains nothing executable.
    pub(crate) fn compile_detached(&self, sql: &str) -> Result<Option<PreparedStatement>> {
        let (raw, tail) = PreparedStatement::compile(self.raw(), sql)?;
        Ok(raw.map(|raw| PreparedStatement::new(0, self.raw(), raw, tail)))
    }
}

fn open_flags(flags: u64) -> OpenFlags {
    if flags == 0 {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::from_bits_truncate(flags as i32)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto::ServerInfo;

    struct NullCluster;

    impl Cluster for NullCluster {
        fn leader(&self) -> Option<String> {
            None
        }

        fn servers(&self) -> crate::Result<Vec<ServerInfo>> {
            Ok(Vec::new())
        }

        fn register(&self, _db: &DatabaseRef) {}

        fn barrier(&self) -> crate::Result<()> {
            Ok(())
        }

        fn checkpoint(&self, _db: &DatabaseRef) -> crate::Result<()> {
            Ok(())
        }
    }

    fn open(config: &GatewayConfig) -> Database {
        Database::open(config, Arc::new(NullCluster), "test.db", 0, None).unwrap()
    }

    #[test]
    fn statement_ids_are_reused_only_after_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut db = open(&config);

        let (first, _) = db.prepare("CREATE TABLE t (n INTEGER)").unwrap();
        let (second, _) = db.prepare("SELECT 1").unwrap();
        assert_eq!((first, second), (0, 1));

        db.finalize(first).unwrap();
        let (reused, params) = db.prepare("SELECT ?").unwrap();
        assert_eq!(reused, 0);
        assert_eq!(params, 1);

        assert!(matches!(db.stmt_mut(2), Err(Error::NoSuchStmt(2))));
        assert!(matches!(db.finalize(2), Err(Error::NoSuchStmt(2))));
    }

    #[test]
    fn open_failure_propagates_engine_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            data_dir: dir.path().join("missing").join("nested"),
            ..Default::default()
        };
        let err = Database::open(&config, Arc::new(NullCluster), "test.db", 0, None).unwrap_err();
        assert_ne!(err.code(), 0);
    }
}
