use serde::{Deserialize, Serialize};

use crate::query::{Params, Value};

/// One of the two pre-allocated request contexts of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotId {
    /// Data-plane traffic: handshake and SQL requests.
    Data = 0,
    /// Control-plane traffic: heartbeat and interrupt.
    Control = 1,
}

impl SlotId {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Leader,
    Client {
        id: u64,
    },
    Heartbeat {
        timestamp: u64,
    },
    Open {
        name: String,
        flags: u64,
        vfs: Option<String>,
    },
    Prepare {
        db_id: u32,
        sql: String,
    },
    Exec {
        db_id: u32,
        stmt_id: u32,
        params: Params,
    },
    Query {
        db_id: u32,
        stmt_id: u32,
        params: Params,
    },
    Finalize {
        db_id: u32,
        stmt_id: u32,
    },
    ExecSql {
        db_id: u32,
        sql: String,
        params: Params,
    },
    QuerySql {
        db_id: u32,
        sql: String,
        params: Params,
    },
    Interrupt,
    /// Produced by the decoder for opcodes this build does not know about.
    Unknown {
        kind: u8,
    },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Leader => RequestKind::Leader,
            Request::Client { .. } => RequestKind::Client,
            Request::Heartbeat { .. } => RequestKind::Heartbeat,
            Request::Open { .. } => RequestKind::Open,
            Request::Prepare { .. } => RequestKind::Prepare,
            Request::Exec { .. } => RequestKind::Exec,
            Request::Query { .. } => RequestKind::Query,
            Request::Finalize { .. } => RequestKind::Finalize,
            Request::ExecSql { .. } => RequestKind::ExecSql,
            Request::QuerySql { .. } => RequestKind::QuerySql,
            Request::Interrupt => RequestKind::Interrupt,
            Request::Unknown { .. } => RequestKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Leader,
    Client,
    Heartbeat,
    Open,
    Prepare,
    Exec,
    Query,
    Finalize,
    ExecSql,
    QuerySql,
    Interrupt,
    Unknown,
}

impl RequestKind {
    /// Slot a request of this kind is admitted on. Control traffic may
    /// interleave with a streaming query on the data slot.
    pub fn slot(self) -> SlotId {
        match self {
            RequestKind::Heartbeat | RequestKind::Interrupt => SlotId::Control,
            _ => SlotId::Data,
        }
    }
}

/// Peer entry in a `Servers` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: u64,
    pub address: String,
}

/// Result of running a statement to completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtResult {
    pub last_insert_id: i64,
    pub rows_affected: u64,
}

/// Marker closing a rows batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchEnd {
    /// More rows follow in a later batch.
    MoreRows,
    /// The batch is terminal.
    Done,
}

/// One batch of a streamed query result. Every batch re-states the column
/// names so each response is self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub end: BatchEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Failure { code: u64, message: String },
    Server { address: String },
    Servers { servers: Vec<ServerInfo> },
    Welcome { heartbeat_timeout: u64 },
    Db { id: u32 },
    Stmt { db_id: u32, stmt_id: u32, params: u64 },
    Result(StmtResult),
    Rows(RowSet),
    Empty,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn control_traffic_targets_slot_one() {
        assert_eq!(Request::Heartbeat { timestamp: 0 }.kind().slot(), SlotId::Control);
        assert_eq!(Request::Interrupt.kind().slot(), SlotId::Control);
    }

    #[test]
    fn data_traffic_targets_slot_zero() {
        let requests = [
            Request::Leader,
            Request::Client { id: 1 },
            Request::Open { name: "db".into(), flags: 0, vfs: None },
            Request::Prepare { db_id: 0, sql: "SELECT 1".into() },
            Request::Finalize { db_id: 0, stmt_id: 0 },
            Request::Unknown { kind: 42 },
        ];
        for request in &requests {
            assert_eq!(request.kind().slot(), SlotId::Data);
        }
    }
}
