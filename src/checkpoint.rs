//! Cluster checkpoint trigger.
//!
//! The engine invokes the gateway's WAL hook after every committed write
//! with the resulting WAL frame count. Once enough frames accumulate, the
//! hook asks the cluster for a coordinated WAL truncation, but only when no
//! local reader is still trailing the latest committed frame. The admission
//! rule mirrors the engine's own passive-checkpoint rule, lifted to the
//! distributed layer: a reader mark below `mxFrame` whose slot lock cannot
//! be taken means an active reader would be starved, so the checkpoint is
//! postponed until a later commit.

use std::ffi::{c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use rusqlite::{ffi, Connection};

use crate::cluster::{Cluster, DatabaseRef};
use crate::error::Error;
use crate::Result;

/// Reader slots in the wal-index.
pub const READER_COUNT: usize = 5;

/// Size of one wal-index region, as mapped by the engine.
const SHM_REGION_SIZE: c_int = 32768;
/// Two copies of the header precede the checkpoint-info block.
const HDR_COPY_SIZE: usize = std::mem::size_of::<WalIndexHdr>();
/// The reader marks follow the backfill counter of the checkpoint-info
/// block.
const READ_MARKS_OFFSET: usize = 2 * HDR_COPY_SIZE + 4;
/// First reader lock, in wal-index lock offsets; the write, checkpoint and
/// recover locks come first.
const READ_LOCK_BASE: c_int = 3;

/// One copy of the wal-index header, as laid out in shared memory. Only
/// `is_init` and `mx_frame` are consumed; the rest is carried for layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[allow(dead_code)]
struct WalIndexHdr {
    version: u32,
    unused: u32,
    change: u32,
    is_init: u8,
    big_end_cksum: u8,
    page_size: u16,
    mx_frame: u32,
    n_page: u32,
    frame_cksum: [u32; 2],
    salt: [u32; 2],
    cksum: [u32; 2],
}

/// Consistent view of the wal-index fields the trigger needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalSnapshot {
    /// Highest frame committed to the log.
    pub mx_frame: u32,
    /// Per-slot reader marks. Unused slots hold `u32::MAX` and therefore
    /// never read as trailing.
    pub read_marks: [u32; READER_COUNT],
}

/// Probe into the WAL shared-memory index.
pub trait WalIndex {
    /// A consistent header snapshot, or `None` when the index is absent,
    /// uninitialized, or caught mid-update.
    fn snapshot(&self) -> Result<Option<WalSnapshot>>;

    /// Takes and immediately releases an exclusive lock on reader slot
    /// `slot`. `false` means an active reader holds the slot.
    fn probe_reader(&self, slot: usize) -> Result<bool>;
}

/// Checkpoint admission: a cluster checkpoint may only run when no reader
/// is still trailing the latest committed frame. Slot 0 belongs to readers
/// that ignore the WAL entirely and is never probed.
pub fn readers_idle(index: &dyn WalIndex) -> Result<bool> {
    let Some(snapshot) = index.snapshot()? else {
        return Ok(false);
    };
    for slot in 1..READER_COUNT {
        if snapshot.read_marks[slot] < snapshot.mx_frame && !index.probe_reader(slot)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Production [`WalIndex`] over the engine's own VFS methods, so the engine
/// arbitrates in-process and cross-process readers alike.
pub(crate) struct SqliteWalIndex {
    file: *mut ffi::sqlite3_file,
}

impl SqliteWalIndex {
    pub(crate) fn new(db: *mut ffi::sqlite3) -> Result<Self> {
        let mut file: *mut ffi::sqlite3_file = ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_file_control(
                db,
                b"main\0".as_ptr() as *const c_char,
                ffi::SQLITE_FCNTL_FILE_POINTER,
                &mut file as *mut *mut ffi::sqlite3_file as *mut c_void,
            )
        };
        if rc != ffi::SQLITE_OK || file.is_null() {
            return Err(Error::Sqlite {
                code: rc as u64,
                message: "failed to get main file handle".into(),
            });
        }
        Ok(Self { file })
    }

    fn methods(&self) -> Option<&ffi::sqlite3_io_methods> {
        let methods = unsafe { (*self.file).pMethods };
        if methods.is_null() || unsafe { (*methods).iVersion } < 2 {
            return None;
        }
        Some(unsafe { &*methods })
    }
}

impl WalIndex for SqliteWalIndex {
    fn snapshot(&self) -> Result<Option<WalSnapshot>> {
        let Some(methods) = self.methods() else {
            return Ok(None);
        };
        let Some(shm_map) = methods.xShmMap else {
            return Ok(None);
        };
        let mut region: *mut c_void = ptr::null_mut();
        // Non-extending map: before the first WAL write the region does not
        // exist and the engine hands back a null view.
        let rc = unsafe { shm_map(self.file, 0, SHM_REGION_SIZE, 0, &mut region) };
        if rc != ffi::SQLITE_OK {
            return Err(Error::Sqlite {
                code: rc as u64,
                message: format!("failed to map the wal-index ({rc})"),
            });
        }
        if region.is_null() {
            return Ok(None);
        }

        let base = region as *const u8;
        let h1: [u8; HDR_COPY_SIZE] =
            unsafe { (base as *const [u8; HDR_COPY_SIZE]).read_volatile() };
        let h2: [u8; HDR_COPY_SIZE] =
            unsafe { (base.add(HDR_COPY_SIZE) as *const [u8; HDR_COPY_SIZE]).read_volatile() };
        if h1 != h2 {
            // A writer is mid-update; try again on a later commit.
            return Ok(None);
        }
        let hdr: WalIndexHdr = match bytemuck::try_pod_read_unaligned(&h1) {
            Ok(hdr) => hdr,
            Err(_) => return Ok(None),
        };
        if hdr.is_init == 0 {
            return Ok(None);
        }

        let mut read_marks = [0u32; READER_COUNT];
        for (slot, mark) in read_marks.iter_mut().enumerate() {
            let offset = READ_MARKS_OFFSET + slot * std::mem::size_of::<u32>();
            *mark = unsafe { (base.add(offset) as *const u32).read_volatile() };
        }

        Ok(Some(WalSnapshot {
            mx_frame: hdr.mx_frame,
            read_marks,
        }))
    }

    fn probe_reader(&self, slot: usize) -> Result<bool> {
        let Some(methods) = self.methods() else {
            return Ok(false);
        };
        let Some(shm_lock) = methods.xShmLock else {
            return Ok(false);
        };
        let offset = READ_LOCK_BASE + slot as c_int;
        let rc = unsafe {
            shm_lock(
                self.file,
                offset,
                1,
                ffi::SQLITE_SHM_LOCK | ffi::SQLITE_SHM_EXCLUSIVE,
            )
        };
        match rc {
            ffi::SQLITE_OK => {
                unsafe {
                    shm_lock(
                        self.file,
                        offset,
                        1,
                        ffi::SQLITE_SHM_UNLOCK | ffi::SQLITE_SHM_EXCLUSIVE,
                    )
                };
                Ok(true)
            }
            ffi::SQLITE_BUSY => Ok(false),
            rc => Err(Error::Sqlite {
                code: rc as u64,
                message: format!("wal-index reader lock failed ({rc})"),
            }),
        }
    }
}

/// Context installed as the engine's WAL hook.
///
/// Runs on the engine's commit path: it takes no gateway-level locks and
/// treats busy readers as a normal, expected outcome.
pub(crate) struct CheckpointHook {
    cluster: Arc<dyn Cluster>,
    db: DatabaseRef,
    threshold: u32,
    index: SqliteWalIndex,
}

impl CheckpointHook {
    fn on_commit(&self, frames: u32) -> c_int {
        if frames < self.threshold {
            return ffi::SQLITE_OK;
        }
        match readers_idle(&self.index) {
            Ok(true) => {
                tracing::trace!(frames, "triggering cluster checkpoint");
                if let Err(e) = self.cluster.checkpoint(&self.db) {
                    // The commit already succeeded; a failed checkpoint only
                    // delays log truncation.
                    tracing::warn!("cluster checkpoint failed: {e}");
                }
            }
            Ok(false) => {
                tracing::trace!(frames, "checkpoint postponed, a reader is trailing the wal");
            }
            Err(e) => {
                tracing::warn!("wal-index probe failed: {e}");
            }
        }
        ffi::SQLITE_OK
    }
}

/// Installs the WAL hook on `conn`.
///
/// The context is handed out as a raw pointer on purpose: the engine calls
/// the hook while the connection's owner is borrowed mutably, so nothing
/// with ownership semantics may alias it. Release it with [`uninstall`]
/// once the connection can no longer commit.
pub(crate) fn install(
    conn: &Connection,
    cluster: Arc<dyn Cluster>,
    db: DatabaseRef,
    threshold: u32,
) -> Result<*mut CheckpointHook> {
    let raw = unsafe { conn.handle() };
    let hook = Box::into_raw(Box::new(CheckpointHook {
        cluster,
        db,
        threshold,
        index: SqliteWalIndex::new(raw)?,
    }));
    unsafe {
        ffi::sqlite3_wal_hook(raw, Some(wal_hook_trampoline), hook as *mut c_void);
    }
    Ok(hook)
}

/// Clears the WAL hook and releases its context.
pub(crate) fn uninstall(conn: &Connection, hook: *mut CheckpointHook) {
    unsafe {
        ffi::sqlite3_wal_hook(conn.handle(), None, ptr::null_mut());
        drop(Box::from_raw(hook));
    }
}

unsafe extern "C" fn wal_hook_trampoline(
    ctx: *mut c_void,
    _db: *mut ffi::sqlite3,
    _db_name: *const c_char,
    frames: c_int,
) -> c_int {
    let hook = &*(ctx as *const CheckpointHook);
    hook.on_commit(frames as u32)
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use super::*;

    struct FakeWalIndex {
        snapshot: Option<WalSnapshot>,
        busy: [bool; READER_COUNT],
        probed: RefCell<Vec<usize>>,
    }

    impl FakeWalIndex {
        fn new(mx_frame: u32, read_marks: [u32; READER_COUNT]) -> Self {
            Self {
                snapshot: Some(WalSnapshot {
                    mx_frame,
                    read_marks,
                }),
                busy: [false; READER_COUNT],
                probed: RefCell::new(Vec::new()),
            }
        }
    }

    impl WalIndex for FakeWalIndex {
        fn snapshot(&self) -> crate::Result<Option<WalSnapshot>> {
            Ok(self.snapshot)
        }

        fn probe_reader(&self, slot: usize) -> crate::Result<bool> {
            self.probed.borrow_mut().push(slot);
            Ok(!self.busy[slot])
        }
    }

    #[test]
    fn caught_up_readers_are_not_probed() {
        let index = FakeWalIndex::new(70, [0, 70, 70, u32::MAX, u32::MAX]);
        assert!(readers_idle(&index).unwrap());
        assert!(index.probed.borrow().is_empty());
    }

    #[test]
    fn trailing_idle_reader_admits_checkpoint() {
        let index = FakeWalIndex::new(70, [0, 42, u32::MAX, u32::MAX, u32::MAX]);
        assert!(readers_idle(&index).unwrap());
        assert_eq!(*index.probed.borrow(), vec![1]);
    }

    #[test]
    fn busy_trailing_reader_postpones_regardless_of_wal_size() {
        let mut index = FakeWalIndex::new(1 << 30, [0, 42, 7, u32::MAX, u32::MAX]);
        index.busy[2] = true;
        assert!(!readers_idle(&index).unwrap());
    }

    #[test]
    fn slot_zero_is_never_probed() {
        // Mark 0 on slot 0 always trails a non-empty wal; it must not count.
        let index = FakeWalIndex::new(70, [0, u32::MAX, u32::MAX, u32::MAX, u32::MAX]);
        assert!(readers_idle(&index).unwrap());
        assert!(index.probed.borrow().is_empty());
    }

    #[test]
    fn missing_wal_index_postpones() {
        let index = FakeWalIndex {
            snapshot: None,
            busy: [false; READER_COUNT],
            probed: RefCell::new(Vec::new()),
        };
        assert!(!readers_idle(&index).unwrap());
    }

    #[test]
    fn wal_index_probe_on_live_database() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("probe.db")).unwrap();
        conn.pragma_update(None, "journal_mode", "wal").unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1)")
            .unwrap();

        let index = SqliteWalIndex::new(unsafe { conn.handle() }).unwrap();
        let snapshot = index.snapshot().unwrap().expect("wal-index initialized");
        assert!(snapshot.mx_frame > 0);
        assert!(readers_idle(&index).unwrap());
    }

    #[test]
    fn wal_index_absent_before_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("fresh.db")).unwrap();
        let index = SqliteWalIndex::new(unsafe { conn.handle() }).unwrap();
        assert_eq!(index.snapshot().unwrap(), None);
        assert!(!readers_idle(&index).unwrap());
    }
}
