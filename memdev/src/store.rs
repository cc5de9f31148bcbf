//! Sparse store instances and their sessions

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::alloc::SlotAllocator;
use crate::control::{self, ControlArg, Credentials, Opcode, Param, Tunables};
use crate::error::{DeviceError, Result};
use crate::idgen::SessionId;
use crate::interrupt::Interrupt;
use crate::session::AccessMode;
use crate::sparse::{SparseStore, Whence};

/// One sparse store instance
pub struct StoreDevice {
    index: usize,
    default_quantum: usize,
    default_qset: usize,
    store: Mutex<SparseStore>,
}

impl StoreDevice {
    /// # Errors
    /// `InvalidArgument` for bad dimensions.
    pub fn new(index: usize, quantum: usize, qset: usize, alloc: SlotAllocator) -> Result<Self> {
        Ok(Self {
            index,
            default_quantum: quantum,
            default_qset: qset,
            store: Mutex::new(SparseStore::new(quantum, qset, alloc)?),
        })
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Exclusive access to the store, giving up if `interrupt` fires
    ///
    /// # Errors
    /// `Interrupted`.
    pub async fn lock(&self, interrupt: &Interrupt) -> Result<MutexGuard<'_, SparseStore>> {
        interrupt.guard(self.store.lock()).await
    }

    /// Release all data, waiting for the lock as long as needed
    pub async fn trim(&self) {
        self.store.lock().await.trim();
    }

    /// Open a session; write-only opens empty the store first
    ///
    /// # Errors
    /// `Interrupted` if the interrupt fires while waiting for the lock.
    pub async fn open(
        self: &Arc<Self>,
        id: SessionId,
        mode: AccessMode,
        nonblocking: bool,
        interrupt: Interrupt,
    ) -> Result<StoreSession> {
        if mode == AccessMode::WriteOnly {
            self.lock(&interrupt).await?.trim();
        }
        Ok(StoreSession {
            id,
            mode,
            device: Arc::clone(self),
            pos: AtomicU64::new(0),
            nonblocking: AtomicBool::new(nonblocking),
            interrupt,
        })
    }
}

impl fmt::Debug for StoreDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreDevice(store{})", self.index)
    }
}

/// The control-surface view of a locked store
struct StoreTunables<'a> {
    store: &'a mut SparseStore,
    default_quantum: usize,
    default_qset: usize,
}

impl Tunables for StoreTunables<'_> {
    fn get(&self, param: Param) -> Result<usize> {
        match param {
            Param::Quantum => Ok(self.store.quantum()),
            Param::Qset => Ok(self.store.qset()),
            Param::Capacity => Err(DeviceError::invalid("capacity is not a store parameter")),
        }
    }

    fn set(&mut self, param: Param, value: usize) -> Result<()> {
        match param {
            Param::Quantum => self.store.set_quantum(value),
            Param::Qset => self.store.set_qset(value),
            Param::Capacity => Err(DeviceError::invalid("capacity is not a store parameter")),
        }
    }

    fn reset(&mut self) {
        // The defaults were validated when the device was created
        if let Err(e) = self
            .store
            .set_dimensions(self.default_quantum, self.default_qset)
        {
            log::warn!("store reset: {e}");
        }
    }
}

/// An open handle on a sparse store, with its own file position
pub struct StoreSession {
    id: SessionId,
    mode: AccessMode,
    device: Arc<StoreDevice>,
    pos: AtomicU64,
    nonblocking: AtomicBool,
    interrupt: Interrupt,
}

impl StoreSession {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    #[must_use]
    pub fn device(&self) -> &Arc<StoreDevice> {
        &self.device
    }

    /// Current file position
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    /// Stored for the handle's flags; store I/O never waits for data
    #[must_use]
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Acquire)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Release);
    }

    /// Read at the current position and advance it
    ///
    /// # Errors
    /// `BadAccessMode` on a write-only session, `Interrupted` while
    /// waiting for the lock.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.mode.check_read()?;
        let mut store = self.device.lock(&self.interrupt).await?;
        let pos = self.position();
        let count = store.read(pos, buf);
        self.pos.store(pos + count as u64, Ordering::Release);
        Ok(count)
    }

    /// Write at the current position and advance it
    ///
    /// # Errors
    /// `BadAccessMode` on a read-only session, `Interrupted` while waiting
    /// for the lock, `OutOfMemory` if storage cannot grow.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.mode.check_write()?;
        let mut store = self.device.lock(&self.interrupt).await?;
        let pos = self.position();
        let count = store.write(pos, data)?;
        self.pos.store(pos + count as u64, Ordering::Release);
        Ok(count)
    }

    /// Read at `offset` without touching the file position
    ///
    /// # Errors
    /// As [`StoreSession::read`].
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.mode.check_read()?;
        Ok(self.device.lock(&self.interrupt).await?.read(offset, buf))
    }

    /// Write at `offset` without touching the file position
    ///
    /// # Errors
    /// As [`StoreSession::write`].
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.mode.check_write()?;
        self.device.lock(&self.interrupt).await?.write(offset, data)
    }

    /// Move the file position
    ///
    /// # Errors
    /// `InvalidArgument` for a negative target, `Interrupted` while
    /// waiting for the lock.
    pub async fn seek(&self, delta: i64, whence: Whence) -> Result<u64> {
        let store = self.device.lock(&self.interrupt).await?;
        let pos = store.seek(self.position(), delta, whence)?;
        self.pos.store(pos, Ordering::Release);
        Ok(pos)
    }

    /// Bytes of valid data in the store
    ///
    /// # Errors
    /// `Interrupted` while waiting for the lock.
    pub async fn size(&self) -> Result<u64> {
        Ok(self.device.lock(&self.interrupt).await?.size())
    }

    /// Run a control opcode against this store, holding its lock
    ///
    /// # Errors
    /// See [`control::dispatch`]; `Interrupted` while waiting for the lock.
    pub async fn control(
        &self,
        op: Opcode,
        arg: ControlArg<'_>,
        creds: Credentials,
    ) -> Result<i64> {
        let mut store = self.device.lock(&self.interrupt).await?;
        let mut target = StoreTunables {
            store: &mut store,
            default_quantum: self.device.default_quantum,
            default_qset: self.device.default_qset,
        };
        control::dispatch(op, arg, creds, &mut target)
    }
}

impl fmt::Debug for StoreSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreSession(store{} {}, mode={:?}, pos={})",
            self.device.index,
            self.id,
            self.mode,
            self.position()
        )
    }
}

impl embedded_io_async::ErrorType for StoreSession {
    type Error = DeviceError;
}

impl embedded_io_async::Read for StoreSession {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        StoreSession::read(self, buf).await
    }
}

impl embedded_io_async::Write for StoreSession {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        StoreSession::write(self, buf).await
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl embedded_io_async::Seek for StoreSession {
    async fn seek(&mut self, pos: embedded_io_async::SeekFrom) -> Result<u64> {
        use embedded_io_async::SeekFrom;
        let (delta, whence) = match pos {
            SeekFrom::Start(offset) => (
                i64::try_from(offset).map_err(|_| DeviceError::invalid("seek offset too large"))?,
                Whence::Absolute,
            ),
            SeekFrom::Current(delta) => (delta, Whence::Relative),
            SeekFrom::End(delta) => (delta, Whence::FromEnd),
        };
        StoreSession::seek(self, delta, whence).await
    }
}
