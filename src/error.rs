use rusqlite::ffi;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The slot designated for the request still holds an in-flight
    /// request. This is the only error `Gateway::handle` returns without
    /// flushing a response.
    #[error("concurrent request limit exceeded")]
    GatewayBusy,
    #[error("invalid request type {0}")]
    InvalidRequestType(u8),
    #[error("a database for this connection is already open")]
    DbAlreadyOpen,
    #[error("no db with id {0}")]
    NoSuchDb(u32),
    #[error("no stmt with id {0}")]
    NoSuchStmt(u32),
    #[error("failed to get cluster leader")]
    NoLeader,
    #[error("failed to get cluster servers")]
    ClusterServers { code: u64 },
    #[error("raft barrier failed")]
    Barrier { code: u64 },
    #[error("cannot bind parameters to multi-statement SQL")]
    MultiStmtBindings,
    #[error("empty query")]
    EmptyQuery,
    /// A non-OK return from the engine, carrying its code and message
    /// verbatim.
    #[error("{message}")]
    Sqlite { code: u64, message: String },
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Engine-level code rendered into `Failure` responses.
    pub fn code(&self) -> u64 {
        match self {
            Error::GatewayBusy | Error::InvalidRequestType(_) => ffi::SQLITE_ERROR as u64,
            Error::DbAlreadyOpen => ffi::SQLITE_BUSY as u64,
            Error::NoSuchDb(_) | Error::NoSuchStmt(_) => ffi::SQLITE_NOTFOUND as u64,
            // Older clients expect NOMEM when no leader is known; kept for
            // wire compatibility.
            Error::NoLeader => ffi::SQLITE_NOMEM as u64,
            Error::ClusterServers { code } | Error::Barrier { code } => *code,
            Error::MultiStmtBindings | Error::EmptyQuery => ffi::SQLITE_ERROR as u64,
            Error::Sqlite { code, .. } => *code,
            Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)) => e.extended_code as u64,
            Error::Rusqlite(_) => ffi::SQLITE_ERROR as u64,
        }
    }
}
