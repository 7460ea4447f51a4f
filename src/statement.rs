use std::ffi::{c_char, c_int, CStr};
use std::ptr::{self, NonNull};

use bytes::Bytes;
use rusqlite::ffi;

use crate::error::Error;
use crate::proto::{BatchEnd, RowSet, StmtResult};
use crate::query::{Params, Value};
use crate::Result;

/// Fixed per-row overhead in the batch budget, covering the framing header
/// written in front of each tuple.
const ROW_OVERHEAD: usize = 8;

/// A compiled statement belonging to one database handle.
///
/// Holds the raw statement pointer directly so a query cursor can be
/// suspended across response flushes. Whoever owns it must tear it down
/// before the connection closes; `Drop` finalizes as a backstop.
#[derive(Debug)]
pub struct PreparedStatement {
    id: u32,
    db: *mut ffi::sqlite3,
    raw: *mut ffi::sqlite3_stmt,
    /// Byte offset where the residual tail of the compiled text starts.
    /// Meaningful for multi-statement text.
    tail: usize,
}

impl PreparedStatement {
    pub(crate) fn new(
        id: u32,
        db: *mut ffi::sqlite3,
        raw: NonNull<ffi::sqlite3_stmt>,
        tail: usize,
    ) -> Self {
        Self {
            id,
            db,
            raw: raw.as_ptr(),
            tail,
        }
    }

    /// Compiles the first statement of `sql`.
    ///
    /// Returns the raw statement (`None` when the text contains nothing
    /// executable) and the byte offset where the remaining text starts.
    pub(crate) fn compile(
        db: *mut ffi::sqlite3,
        sql: &str,
    ) -> Result<(Option<NonNull<ffi::sqlite3_stmt>>, usize)> {
        let mut raw = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                db,
                sql.as_ptr() as *const c_char,
                sql.len() as c_int,
                &mut raw,
                &mut tail,
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(last_error(db, rc));
        }
        let consumed = if tail.is_null() {
            sql.len()
        } else {
            // The tail always points inside the buffer the engine was given.
            unsafe { tail.offset_from(sql.as_ptr() as *const c_char) as usize }
        };
        Ok((NonNull::new(raw), consumed))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Offset of the residual SQL tail in the text this statement was
    /// compiled from.
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Number of bind placeholders in the compiled form.
    pub fn parameter_count(&self) -> u64 {
        unsafe { ffi::sqlite3_bind_parameter_count(self.raw) as u64 }
    }

    /// Binds the positional tuple, resetting any previous execution first.
    pub fn bind(&mut self, params: &Params) -> Result<()> {
        unsafe {
            ffi::sqlite3_reset(self.raw);
            ffi::sqlite3_clear_bindings(self.raw);
        }
        for (i, value) in params.iter().enumerate() {
            let idx = i as c_int + 1;
            let rc = unsafe {
                match value {
                    Value::Null => ffi::sqlite3_bind_null(self.raw, idx),
                    Value::Integer(v) => ffi::sqlite3_bind_int64(self.raw, idx, *v),
                    Value::Real(v) => ffi::sqlite3_bind_double(self.raw, idx, *v),
                    Value::Text(s) => ffi::sqlite3_bind_text(
                        self.raw,
                        idx,
                        s.as_ptr() as *const c_char,
                        s.len() as c_int,
                        ffi::SQLITE_TRANSIENT(),
                    ),
                    Value::Blob(b) => ffi::sqlite3_bind_blob(
                        self.raw,
                        idx,
                        b.as_ptr() as *const _,
                        b.len() as c_int,
                        ffi::SQLITE_TRANSIENT(),
                    ),
                }
            };
            if rc != ffi::SQLITE_OK {
                return Err(self.error(rc));
            }
        }
        Ok(())
    }

    /// Runs the statement to completion.
    pub fn exec(&mut self) -> Result<StmtResult> {
        loop {
            match unsafe { ffi::sqlite3_step(self.raw) } {
                ffi::SQLITE_ROW => continue,
                ffi::SQLITE_DONE => break,
                rc => {
                    let err = self.error(rc);
                    unsafe { ffi::sqlite3_reset(self.raw) };
                    return Err(err);
                }
            }
        }
        unsafe { ffi::sqlite3_reset(self.raw) };
        Ok(StmtResult {
            last_insert_id: unsafe { ffi::sqlite3_last_insert_rowid(self.db) },
            rows_affected: unsafe { ffi::sqlite3_changes(self.db) } as u64,
        })
    }

    /// Produces the next batch of a streamed query.
    ///
    /// Rows accumulate until their estimated encoded size reaches `budget`,
    /// closing the batch with `MoreRows`; the cursor then stays usable for
    /// the next call. A step error discards the partially built batch.
    pub fn fetch(&mut self, budget: usize) -> Result<RowSet> {
        let columns = self.columns();
        let mut rows: Vec<Vec<Value>> = Vec::new();
        let mut size = 0;
        loop {
            match unsafe { ffi::sqlite3_step(self.raw) } {
                ffi::SQLITE_ROW => {
                    let row = self.row();
                    size += ROW_OVERHEAD + row.iter().map(Value::wire_size).sum::<usize>();
                    rows.push(row);
                    if size >= budget {
                        return Ok(RowSet {
                            columns,
                            rows,
                            end: BatchEnd::MoreRows,
                        });
                    }
                }
                ffi::SQLITE_DONE => {
                    unsafe { ffi::sqlite3_reset(self.raw) };
                    return Ok(RowSet {
                        columns,
                        rows,
                        end: BatchEnd::Done,
                    });
                }
                rc => {
                    let err = self.error(rc);
                    unsafe { ffi::sqlite3_reset(self.raw) };
                    return Err(err);
                }
            }
        }
    }

    /// Releases the read transaction without discarding the statement.
    pub fn reset(&mut self) {
        unsafe { ffi::sqlite3_reset(self.raw) };
    }

    pub fn finalize(mut self) -> Result<()> {
        let rc = unsafe { ffi::sqlite3_finalize(self.raw) };
        self.raw = ptr::null_mut();
        if rc != ffi::SQLITE_OK {
            return Err(last_error(self.db, rc));
        }
        Ok(())
    }

    fn columns(&self) -> Vec<String> {
        let n = unsafe { ffi::sqlite3_column_count(self.raw) };
        (0..n)
            .map(|i| {
                let name = unsafe { ffi::sqlite3_column_name(self.raw, i) };
                if name.is_null() {
                    String::new()
                } else {
                    unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
                }
            })
            .collect()
    }

    fn row(&self) -> Vec<Value> {
        let n = unsafe { ffi::sqlite3_column_count(self.raw) };
        (0..n).map(|i| self.column_value(i)).collect()
    }

    fn column_value(&self, i: c_int) -> Value {
        match unsafe { ffi::sqlite3_column_type(self.raw, i) } {
            ffi::SQLITE_INTEGER => Value::Integer(unsafe { ffi::sqlite3_column_int64(self.raw, i) }),
            ffi::SQLITE_FLOAT => Value::Real(unsafe { ffi::sqlite3_column_double(self.raw, i) }),
            ffi::SQLITE_TEXT => {
                let text = unsafe { ffi::sqlite3_column_text(self.raw, i) };
                let len = unsafe { ffi::sqlite3_column_bytes(self.raw, i) } as usize;
                if text.is_null() {
                    Value::Text(String::new())
                } else {
                    let bytes = unsafe { std::slice::from_raw_parts(text, len) };
                    Value::Text(String::from_utf8_lossy(bytes).into_owned())
                }
            }
            ffi::SQLITE_BLOB => {
                let blob = unsafe { ffi::sqlite3_column_blob(self.raw, i) };
                let len = unsafe { ffi::sqlite3_column_bytes(self.raw, i) } as usize;
                if blob.is_null() || len == 0 {
                    Value::Blob(Bytes::new())
                } else {
                    let bytes = unsafe { std::slice::from_raw_parts(blob as *const u8, len) };
                    Value::Blob(Bytes::copy_from_slice(bytes))
                }
            }
            _ => Value::Null,
        }
    }

    fn error(&self, rc: c_int) -> Error {
        last_error(self.db, rc)
    }
}

impl Drop for PreparedStatement {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe { ffi::sqlite3_finalize(self.raw) };
        }
    }
}

/// Error text of the connection's most recent failure, paired with `rc`.
pub(crate) fn last_error(db: *mut ffi::sqlite3, rc: c_int) -> Error {
    let message = unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(db)) }
        .to_string_lossy()
        .into_owned();
    Error::Sqlite {
        code: rc as u64,
        message,
    }
}

/// Dense statement table with first-free-slot id reuse. Ids are stable for
/// the lifetime of a statement and only reused after finalization.
#[derive(Debug, Default)]
pub(crate) struct StatementRegistry {
    entries: Vec<Option<PreparedStatement>>,
}

impl StatementRegistry {
    /// Id the next inserted statement will get.
    pub fn vacant_id(&self) -> u32 {
        self.entries
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.entries.len()) as u32
    }

    pub fn insert(&mut self, stmt: PreparedStatement) {
        let idx = stmt.id() as usize;
        if idx == self.entries.len() {
            self.entries.push(Some(stmt));
        } else {
            debug_assert!(self.entries[idx].is_none());
            self.entries[idx] = Some(stmt);
        }
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut PreparedStatement> {
        self.entries.get_mut(id as usize).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, id: u32) -> Option<PreparedStatement> {
        self.entries.get_mut(id as usize).and_then(Option::take)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rusqlite::Connection;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (n INTEGER, s TEXT)")
            .unwrap();
        conn
    }

    fn compile(conn: &Connection, sql: &str) -> PreparedStatement {
        let db = unsafe { conn.handle() };
        let (raw, tail) = PreparedStatement::compile(db, sql).unwrap();
        PreparedStatement::new(0, db, raw.unwrap(), tail)
    }

    #[test]
    fn bind_exec_reports_changes() {
        let conn = setup();
        let mut stmt = compile(&conn, "INSERT INTO t VALUES (?, ?)");
        assert_eq!(stmt.parameter_count(), 2);

        stmt.bind(&Params::new(vec![Value::Integer(7), Value::Text("seven".into())]))
            .unwrap();
        let result = stmt.exec().unwrap();
        assert_eq!(result.last_insert_id, 1);
        assert_eq!(result.rows_affected, 1);

        stmt.bind(&Params::new(vec![Value::Integer(8), Value::Null]))
            .unwrap();
        let result = stmt.exec().unwrap();
        assert_eq!(result.last_insert_id, 2);
    }

    #[test]
    fn fetch_single_batch_ends_done() {
        let conn = setup();
        conn.execute_batch("INSERT INTO t VALUES (1, 'a'); INSERT INTO t VALUES (2, 'b')")
            .unwrap();
        let mut stmt = compile(&conn, "SELECT n, s FROM t ORDER BY n");
        let batch = stmt.fetch(1 << 20).unwrap();
        assert_eq!(batch.columns, vec!["n", "s"]);
        assert_eq!(batch.end, BatchEnd::Done);
        assert_eq!(
            batch.rows,
            vec![
                vec![Value::Integer(1), Value::Text("a".into())],
                vec![Value::Integer(2), Value::Text("b".into())],
            ]
        );
    }

    #[test]
    fn fetch_respects_budget() {
        let conn = setup();
        for i in 0..10 {
            conn.execute("INSERT INTO t (n) VALUES (?1)", [i]).unwrap();
        }
        let mut stmt = compile(&conn, "SELECT n FROM t ORDER BY n");
        let mut total = 0;
        let mut batches = 0;
        loop {
            // A one-byte budget closes every batch after a single row.
            let batch = stmt.fetch(1).unwrap();
            total += batch.rows.len();
            batches += 1;
            if batch.end == BatchEnd::Done {
                break;
            }
            assert_eq!(batch.rows.len(), 1);
        }
        assert_eq!(total, 10);
        assert_eq!(batches, 11);
    }

    #[test]
    fn compile_keeps_multi_statement_tail() {
        let conn = setup();
        let sql = "INSERT INTO t (n) VALUES (1); INSERT INTO t (n) VALUES (2)";
        let stmt = compile(&conn, sql);
        assert!(sql[stmt.tail()..].contains("VALUES (2)"));

        let db = unsafe { conn.handle() };
        let (raw, _) = PreparedStatement::compile(db, "  -- nothing here").unwrap();
        assert!(raw.is_none());
    }

    #[test]
    fn step_error_carries_engine_code_and_message() {
        let conn = setup();
        conn.execute_batch("CREATE UNIQUE INDEX t_n ON t (n); INSERT INTO t (n) VALUES (1)")
            .unwrap();
        let mut stmt = compile(&conn, "INSERT INTO t (n) VALUES (1)");
        let err = stmt.exec().unwrap_err();
        match err {
            Error::Sqlite { code, message } => {
                assert_eq!(code, ffi::SQLITE_CONSTRAINT as u64);
                assert!(message.contains("UNIQUE"), "unexpected message: {message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn registry_reuses_ids_after_removal() {
        let conn = setup();
        let db = unsafe { conn.handle() };
        let mut registry = StatementRegistry::default();

        for expected in 0u32..2 {
            let id = registry.vacant_id();
            assert_eq!(id, expected);
            let (raw, tail) = PreparedStatement::compile(db, "SELECT 1").unwrap();
            registry.insert(PreparedStatement::new(id, db, raw.unwrap(), tail));
        }

        registry.remove(0).unwrap().finalize().unwrap();
        assert_eq!(registry.vacant_id(), 0);
        assert!(registry.get_mut(0).is_none());
        assert!(registry.get_mut(1).is_some());
    }
}
