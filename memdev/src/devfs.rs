//! Filesystem-like driver over a [`DeviceTable`]
//!
//! Paths name instances (`/dev/store0`, `chan1`), `open` hands out small
//! integer descriptors, and the remaining calls take a descriptor. One
//! descriptor may be used by several tasks at once: a blocked `read` does
//! not keep a `write` on the same descriptor from running.

use std::collections::HashMap;
use std::os::raw::c_int;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::control::{ControlArg, Credentials, Opcode};
use crate::error::{DeviceError, Result};
use crate::session::{AccessMode, Readiness, Session};
use crate::sparse::Whence;
use crate::table::{DeviceId, DeviceTable, OpenOptions};
use crate::waitq::Signal;

const DEV_PREFIX: &str = "/dev/";

/// Per-driver file descriptor table
struct FdTable {
    table: HashMap<c_int, Arc<Session>>,
    limit: c_int,
}

impl FdTable {
    fn new() -> Self {
        Self::with_limit(c_int::MAX)
    }

    fn with_limit(limit: c_int) -> Self {
        Self {
            table: HashMap::new(),
            limit,
        }
    }

    /// Store `session` under the lowest free descriptor
    fn insert(&mut self, session: Session) -> Result<c_int> {
        let fd = (0..self.limit)
            .find(|fd| !self.table.contains_key(fd))
            .ok_or(DeviceError::TooManyOpen)?;
        self.table.insert(fd, Arc::new(session));
        Ok(fd)
    }

    fn get(&self, fd: c_int) -> Option<Arc<Session>> {
        self.table.get(&fd).cloned()
    }

    fn remove(&mut self, fd: c_int) -> Option<Arc<Session>> {
        self.table.remove(&fd)
    }
}

/// Resolve `/dev/store0` or `store0` to an instance address
///
/// # Errors
/// `NoSuchDevice` for anything else.
pub fn resolve(path: &str) -> Result<DeviceId> {
    path.strip_prefix(DEV_PREFIX).unwrap_or(path).parse()
}

pub struct DevFs {
    table: Arc<DeviceTable>,
    fds: Mutex<FdTable>,
    creds: Credentials,
}

impl DevFs {
    /// A driver whose control calls run with `creds`
    #[must_use]
    pub fn new(table: Arc<DeviceTable>, creds: Credentials) -> Self {
        Self {
            table,
            fds: Mutex::new(FdTable::new()),
            creds,
        }
    }

    #[must_use]
    pub fn table(&self) -> &Arc<DeviceTable> {
        &self.table
    }

    fn session(&self, fd: c_int) -> Result<Arc<Session>> {
        self.fds
            .lock()
            .get(fd)
            .ok_or_else(|| DeviceError::NoSuchDevice(format!("fd {fd}")))
    }

    /// Open `path` and return the lowest free descriptor
    ///
    /// # Errors
    /// `NoSuchDevice` for an unknown path, `TooManyOpen` if every
    /// descriptor is taken; see [`DeviceTable::open`].
    pub async fn open(&self, path: &str, options: &OpenOptions) -> Result<c_int> {
        let id = resolve(path)?;
        let session = self.table.open(id, options).await?;
        let fd = self.fds.lock().insert(session)?;
        debug!(path, fd, mode = ?options.mode, "devfs open");
        Ok(fd)
    }

    /// Shorthand for a blocking open with no interrupt
    ///
    /// # Errors
    /// As [`DevFs::open`].
    pub async fn open_mode(&self, path: &str, mode: AccessMode) -> Result<c_int> {
        self.open(path, &OpenOptions::new(mode)).await
    }

    /// # Errors
    /// `NoSuchDevice` for a closed descriptor; see [`Session::read`].
    pub async fn read(&self, fd: c_int, buf: &mut [u8]) -> Result<usize> {
        let session = self.session(fd)?;
        let n = session.read(buf).await?;
        trace!(fd, bytes = n, "devfs read");
        Ok(n)
    }

    /// # Errors
    /// `NoSuchDevice` for a closed descriptor; see [`Session::write`].
    pub async fn write(&self, fd: c_int, data: &[u8]) -> Result<usize> {
        let session = self.session(fd)?;
        let n = session.write(data).await?;
        trace!(fd, bytes = n, "devfs write");
        Ok(n)
    }

    /// Write all of `data`, looping over short writes
    ///
    /// # Errors
    /// As [`DevFs::write`]; bytes written before the error stay written.
    pub async fn write_all(&self, fd: c_int, mut data: &[u8]) -> Result<()> {
        let session = self.session(fd)?;
        while !data.is_empty() {
            let n = session.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// # Errors
    /// `IllegalSeek` on a channel; see [`Session::seek`].
    pub async fn lseek(&self, fd: c_int, delta: i64, whence: Whence) -> Result<u64> {
        self.session(fd)?.seek(delta, whence).await
    }

    /// Run control opcode `nr` with the driver's credentials
    ///
    /// # Errors
    /// `InvalidArgument` for an unknown opcode; see
    /// [`crate::control::dispatch`].
    pub async fn ioctl(&self, fd: c_int, nr: u32, arg: ControlArg<'_>) -> Result<i64> {
        let session = self.session(fd)?;
        let op = Opcode::from_nr(nr)?;
        let ret = session.control(op, arg, self.creds).await;
        if let Err(e) = &ret {
            debug!(fd, nr, error = %e, "devfs ioctl failed");
        }
        ret
    }

    /// Immediate readiness of `fd`
    ///
    /// # Errors
    /// `NoSuchDevice` for a closed descriptor.
    pub async fn poll(&self, fd: c_int) -> Result<Readiness> {
        self.session(fd)?.poll().await
    }

    /// Wait until `fd` is ready for one of `interest`
    ///
    /// # Errors
    /// `Interrupted` if the descriptor's interrupt fires first.
    pub async fn poll_wait(&self, fd: c_int, interest: Readiness) -> Result<Readiness> {
        self.session(fd)?.wait_ready(interest).await
    }

    /// Enable or disable asynchronous notification on `fd`
    ///
    /// # Errors
    /// `InvalidArgument` on a store.
    pub fn fasync(&self, fd: c_int, enable: bool) -> Result<()> {
        self.session(fd)?.set_async(enable)
    }

    /// Wait for the next notification delivered to `fd`
    ///
    /// # Errors
    /// `InvalidArgument` on a store, `Interrupted` if the interrupt fires.
    pub async fn next_signal(&self, fd: c_int) -> Result<Signal> {
        self.session(fd)?.next_signal().await
    }

    /// # Errors
    /// `NoSuchDevice` for a closed descriptor.
    pub fn set_nonblocking(&self, fd: c_int, nonblocking: bool) -> Result<()> {
        self.session(fd)?.set_nonblocking(nonblocking);
        Ok(())
    }

    /// Release `fd`
    ///
    /// The session itself is dropped once calls still running on it finish.
    ///
    /// # Errors
    /// `NoSuchDevice` if `fd` is not open.
    pub fn close(&self, fd: c_int) -> Result<()> {
        let removed = self.fds.lock().remove(fd);
        let Some(session) = removed else {
            warn!(fd, "devfs close: descriptor not open");
            return Err(DeviceError::NoSuchDevice(format!("fd {fd}")));
        };
        debug!(fd, device = %session.device_id(), session = %session.id(), "devfs close");
        Ok(())
    }
}
