use std::sync::Arc;

use crate::cluster::Cluster;
use crate::config::GatewayConfig;
use crate::database::Database;
use crate::error::Error;
use crate::proto::{BatchEnd, Request, RequestKind, Response, SlotId, StmtResult};
use crate::query::Params;
use crate::statement::PreparedStatement;
use crate::Result;

/// Flush capability handed to the gateway by the transport.
///
/// `flush` is invoked exactly once per request, or once per batch of a
/// streaming query. The response is only valid for the duration of the
/// call: implementations serialize it into their own write buffer before
/// returning, and call [`Gateway::flushed`] once the bytes are on the wire.
/// Until then the owning slot stays busy.
pub trait Transport {
    fn flush(&mut self, slot: SlotId, response: &Response);
}

/// Streaming query parked in the data slot between batches.
enum Cursor {
    /// A registered statement driven by `Query`; stays registered once the
    /// stream drains.
    Prepared(u32),
    /// The ephemeral statement of a `QuerySql`; finalized when the stream
    /// drains, fails, or is interrupted.
    Owned(PreparedStatement),
}

#[derive(Default)]
struct RequestSlot {
    request: Option<Request>,
    cursor: Option<Cursor>,
}

/// Per-connection request dispatcher: accepts decoded requests, runs them
/// against the local database and the cluster, and flushes framed responses
/// through the transport.
///
/// A gateway is single-threaded and cooperative. Handlers run to completion
/// on the caller's thread; the only suspension point is the gap between a
/// `flush` and the matching [`Gateway::flushed`], which is where a
/// streaming query parks its cursor.
pub struct Gateway<T: Transport> {
    config: Arc<GatewayConfig>,
    cluster: Arc<dyn Cluster>,
    transport: T,
    client_id: u64,
    heartbeat: u64,
    // Slots may hold statement cursors and must drop before the database.
    slots: [RequestSlot; 2],
    db: Option<Database>,
}

impl<T: Transport> Gateway<T> {
    pub fn new(config: Arc<GatewayConfig>, cluster: Arc<dyn Cluster>, transport: T) -> Self {
        Self {
            config,
            cluster,
            transport,
            client_id: 0,
            heartbeat: 0,
            slots: Default::default(),
            db: None,
        }
    }

    /// Whether a request of `kind` would currently be admitted.
    pub fn accepts(&self, kind: RequestKind) -> bool {
        self.slots[kind.slot().index()].request.is_none()
    }

    /// Identifier assigned at the handshake. Client registration is a
    /// placeholder, so this is always 0.
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Timestamp of the latest heartbeat, for idle-connection policing.
    pub fn last_heartbeat(&self) -> u64 {
        self.heartbeat
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Entry point for one decoded request.
    ///
    /// Fails with [`Error::GatewayBusy`] without flushing anything when the
    /// designated slot is occupied; otherwise flushes exactly one response
    /// (the first batch, for a streaming query) and returns `Ok`.
    pub fn handle(&mut self, request: Request) -> Result<()> {
        let kind = request.kind();
        let slot = kind.slot();
        if !self.accepts(kind) {
            tracing::debug!(?kind, "request rejected, slot busy");
            return Err(Error::GatewayBusy);
        }
        tracing::trace!(?kind, "handling request");
        let response = self.dispatch(&request).unwrap_or_else(failure);
        self.slots[slot.index()].request = Some(request);
        self.transport.flush(slot, &response);
        Ok(())
    }

    /// Completion callback: the transport finished writing the response for
    /// `slot`. Resumes a suspended streaming query or frees the slot.
    pub fn flushed(&mut self, slot: SlotId) {
        match self.slots[slot.index()].cursor.take() {
            Some(cursor) => {
                let response = self.resume(cursor).unwrap_or_else(failure);
                self.transport.flush(slot, &response);
            }
            None => self.slots[slot.index()].request = None,
        }
    }

    /// Advisory: the transport dropped a queued response without writing
    /// it. Implies no prior `flush` completed for this request; the slot is
    /// left untouched.
    pub fn aborted(&mut self, slot: SlotId) {
        tracing::debug!(?slot, "response aborted by transport");
    }

    fn dispatch(&mut self, request: &Request) -> Result<Response> {
        match request {
            Request::Leader => self.handle_leader(),
            Request::Client { id } => self.handle_client(*id),
            Request::Heartbeat { timestamp } => self.handle_heartbeat(*timestamp),
            Request::Open { name, flags, vfs } => self.handle_open(name, *flags, vfs.as_deref()),
            Request::Prepare { db_id, sql } => self.handle_prepare(*db_id, sql),
            Request::Exec {
                db_id,
                stmt_id,
                params,
            } => self.handle_exec(*db_id, *stmt_id, params),
            Request::Query {
                db_id,
                stmt_id,
                params,
            } => self.handle_query(*db_id, *stmt_id, params),
            Request::Finalize { db_id, stmt_id } => self.handle_finalize(*db_id, *stmt_id),
            Request::ExecSql { db_id, sql, params } => self.handle_exec_sql(*db_id, sql, params),
            Request::QuerySql { db_id, sql, params } => self.handle_query_sql(*db_id, sql, params),
            Request::Interrupt => self.handle_interrupt(),
            Request::Unknown { kind } => Err(Error::InvalidRequestType(*kind)),
        }
    }

    fn handle_leader(&mut self) -> Result<Response> {
        match self.cluster.leader() {
            Some(address) => Ok(Response::Server { address }),
            None => Err(Error::NoLeader),
        }
    }

    fn handle_client(&mut self, _id: u64) -> Result<Response> {
        // Client registration is a placeholder; the connection keeps id 0
        // regardless of the id the request carries.
        Ok(Response::Welcome {
            heartbeat_timeout: self.config.heartbeat_timeout.as_millis() as u64,
        })
    }

    fn handle_heartbeat(&mut self, timestamp: u64) -> Result<Response> {
        let servers = self
            .cluster
            .servers()
            .map_err(|e| Error::ClusterServers { code: e.code() })?;
        // Guarded against a client clock stepping backwards.
        self.heartbeat = self.heartbeat.max(timestamp);
        Ok(Response::Servers { servers })
    }

    fn handle_open(&mut self, name: &str, flags: u64, vfs: Option<&str>) -> Result<Response> {
        if self.db.is_some() {
            return Err(Error::DbAlreadyOpen);
        }
        let db = Database::open(&self.config, self.cluster.clone(), name, flags, vfs)?;
        self.cluster.register(db.handle());
        let id = db.id();
        self.db = Some(db);
        Ok(Response::Db { id })
    }

    /// All SQL handlers wait for the replication log to be applied locally
    /// up to the latest committed index before touching the database.
    fn barrier(&self) -> Result<()> {
        self.cluster
            .barrier()
            .map_err(|e| Error::Barrier { code: e.code() })
    }

    fn db_mut(&mut self, id: u32) -> Result<&mut Database> {
        match self.db.as_mut() {
            Some(db) if db.id() == id => Ok(db),
            _ => Err(Error::NoSuchDb(id)),
        }
    }

    fn handle_prepare(&mut self, db_id: u32, sql: &str) -> Result<Response> {
        self.barrier()?;
        let (stmt_id, params) = self.db_mut(db_id)?.prepare(sql)?;
        Ok(Response::Stmt {
            db_id,
            stmt_id,
            params,
        })
    }

    fn handle_exec(&mut self, db_id: u32, stmt_id: u32, params: &Params) -> Result<Response> {
        self.barrier()?;
        let stmt = self.db_mut(db_id)?.stmt_mut(stmt_id)?;
        stmt.bind(params)?;
        Ok(Response::Result(stmt.exec()?))
    }

    fn handle_query(&mut self, db_id: u32, stmt_id: u32, params: &Params) -> Result<Response> {
        self.barrier()?;
        let budget = self.config.max_batch_size;
        let stmt = self.db_mut(db_id)?.stmt_mut(stmt_id)?;
        stmt.bind(params)?;
        let batch = stmt.fetch(budget)?;
        if batch.end == BatchEnd::MoreRows {
            self.slots[SlotId::Data.index()].cursor = Some(Cursor::Prepared(stmt_id));
        }
        Ok(Response::Rows(batch))
    }

    fn handle_finalize(&mut self, db_id: u32, stmt_id: u32) -> Result<Response> {
        self.barrier()?;
        self.db_mut(db_id)?.finalize(stmt_id)?;
        Ok(Response::Empty)
    }

    /// Runs every statement of a multi-statement text, responding with the
    /// result of the last one. Bindings are only well-defined for
    /// single-statement text; anything else is rejected before executing.
    fn handle_exec_sql(&mut self, db_id: u32, sql: &str, params: &Params) -> Result<Response> {
        self.barrier()?;
        let db = self.db_mut(db_id)?;
        let mut result = StmtResult::default();
        let mut offset = 0;
        while offset < sql.len() {
            let Some(mut stmt) = db.compile_detached(&sql[offset..])? else {
                break;
            };
            let next = offset + stmt.tail();
            let outcome = if params.is_empty() {
                stmt.exec()
            } else {
                match db.compile_detached(&sql[next..]) {
                    Ok(Some(_)) => Err(Error::MultiStmtBindings),
                    Ok(None) => stmt.bind(params).and_then(|_| stmt.exec()),
                    Err(e) => Err(e),
                }
            };
            // The statement is always finalized, successful or not; finalize
            // errors are swallowed.
            if let Err(e) = stmt.finalize() {
                tracing::warn!("finalize after exec-sql failed: {e}");
            }
            result = outcome?;
            offset = next;
        }
        Ok(Response::Result(result))
    }

    fn handle_query_sql(&mut self, db_id: u32, sql: &str, params: &Params) -> Result<Response> {
        self.barrier()?;
        let budget = self.config.max_batch_size;
        let db = self.db_mut(db_id)?;
        // Only the first statement of the text is compiled; a tail is
        // ignored.
        let mut stmt = db.compile_detached(sql)?.ok_or(Error::EmptyQuery)?;
        stmt.bind(params)?;
        let batch = stmt.fetch(budget)?;
        match batch.end {
            BatchEnd::MoreRows => {
                self.slots[SlotId::Data.index()].cursor = Some(Cursor::Owned(stmt));
            }
            BatchEnd::Done => {
                if let Err(e) = stmt.finalize() {
                    tracing::warn!("failed to finalize one-shot query: {e}");
                }
            }
        }
        Ok(Response::Rows(batch))
    }

    /// Cancels a streaming query on the data slot, freeing it for a new
    /// request once the in-flight batch (if any) is acknowledged.
    fn handle_interrupt(&mut self) -> Result<Response> {
        let data = SlotId::Data.index();
        if let Some(cursor) = self.slots[data].cursor.take() {
            match cursor {
                Cursor::Prepared(id) => {
                    if let Some(db) = self.db.as_mut() {
                        if let Ok(stmt) = db.stmt_mut(id) {
                            stmt.reset();
                        }
                    }
                }
                Cursor::Owned(stmt) => {
                    if let Err(e) = stmt.finalize() {
                        tracing::warn!("failed to finalize interrupted query: {e}");
                    }
                }
            }
            self.slots[data].request = None;
        }
        Ok(Response::Empty)
    }

    /// Produces the next batch of the suspended query, re-parking the
    /// cursor when more rows remain.
    fn resume(&mut self, cursor: Cursor) -> Result<Response> {
        let budget = self.config.max_batch_size;
        match cursor {
            Cursor::Prepared(id) => {
                let db = self.db.as_mut().ok_or(Error::NoSuchDb(0))?;
                let batch = db.stmt_mut(id)?.fetch(budget)?;
                if batch.end == BatchEnd::MoreRows {
                    self.slots[SlotId::Data.index()].cursor = Some(Cursor::Prepared(id));
                }
                Ok(Response::Rows(batch))
            }
            Cursor::Owned(mut stmt) => {
                let batch = stmt.fetch(budget)?;
                match batch.end {
                    BatchEnd::MoreRows => {
                        self.slots[SlotId::Data.index()].cursor = Some(Cursor::Owned(stmt));
                    }
                    BatchEnd::Done => {
                        if let Err(e) = stmt.finalize() {
                            tracing::warn!("failed to finalize streamed statement: {e}");
                        }
                    }
                }
                Ok(Response::Rows(batch))
            }
        }
    }
}

fn failure(e: Error) -> Response {
    Response::Failure {
        code: e.code(),
        message: e.to_string(),
    }
}
