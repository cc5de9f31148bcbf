//! Open handles on device instances
//!
//! A [`Session`] is what `open` returns: a store session with its own file
//! position, or a channel session attached to the channel's shared ring.
//! Every call is dispatched to the backend; calls that do not make sense
//! for the backend kind fail with a typed error.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::str::FromStr;

use crate::channel::ChannelSession;
use crate::control::{ControlArg, Credentials, Opcode};
use crate::error::{DeviceError, Result};
use crate::idgen::SessionId;
use crate::sparse::Whence;
use crate::store::StoreSession;
use crate::table::DeviceId;
use crate::waitq::Signal;

// ============================================================================
// Access mode
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    #[must_use]
    pub fn can_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    #[must_use]
    pub fn can_write(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }

    /// # Errors
    /// `BadAccessMode` on a write-only handle.
    pub fn check_read(self) -> Result<()> {
        if self.can_read() {
            Ok(())
        } else {
            Err(DeviceError::BadAccessMode)
        }
    }

    /// # Errors
    /// `BadAccessMode` on a read-only handle.
    pub fn check_write(self) -> Result<()> {
        if self.can_write() {
            Ok(())
        } else {
            Err(DeviceError::BadAccessMode)
        }
    }
}

impl FromStr for AccessMode {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" | "ro" | "read" => Ok(Self::ReadOnly),
            "w" | "wo" | "write" => Ok(Self::WriteOnly),
            "rw" | "read-write" => Ok(Self::ReadWrite),
            _ => Err(DeviceError::invalid(format!("unknown access mode '{s}'"))),
        }
    }
}

// ============================================================================
// Readiness
// ============================================================================

pub const POLLIN: u16 = 0x001;
pub const POLLOUT: u16 = 0x004;
pub const POLLRDNORM: u16 = 0x040;
pub const POLLWRNORM: u16 = 0x100;

/// Readiness bitmask, compatible with the classic poll event bits
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Readiness(u16);

impl Readiness {
    pub const READABLE: Self = Self(POLLIN | POLLRDNORM);
    pub const WRITABLE: Self = Self(POLLOUT | POLLWRNORM);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.intersects(Self::READABLE)
    }

    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.intersects(Self::WRITABLE)
    }
}

impl BitOr for Readiness {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Readiness {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_readable() {
            names.push("READABLE");
        }
        if self.is_writable() {
            names.push("WRITABLE");
        }
        write!(f, "Readiness({:#06x}", self.0)?;
        if !names.is_empty() {
            write!(f, " {}", names.join("|"))?;
        }
        write!(f, ")")
    }
}

// ============================================================================
// Session
// ============================================================================

/// An open handle on a store or a channel
#[derive(Debug)]
pub enum Session {
    Store(StoreSession),
    Channel(ChannelSession),
}

impl Session {
    #[must_use]
    pub fn id(&self) -> SessionId {
        match self {
            Self::Store(s) => s.id(),
            Self::Channel(c) => c.id(),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        match self {
            Self::Store(s) => DeviceId::Store(s.device().index()),
            Self::Channel(c) => DeviceId::Channel(c.device().index()),
        }
    }

    #[must_use]
    pub fn mode(&self) -> AccessMode {
        match self {
            Self::Store(s) => s.mode(),
            Self::Channel(c) => c.mode(),
        }
    }

    #[must_use]
    pub fn is_nonblocking(&self) -> bool {
        match self {
            Self::Store(s) => s.is_nonblocking(),
            Self::Channel(c) => c.is_nonblocking(),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        match self {
            Self::Store(s) => s.set_nonblocking(nonblocking),
            Self::Channel(c) => c.set_nonblocking(nonblocking),
        }
    }

    /// # Errors
    /// See [`StoreSession::read`] and [`ChannelSession::read`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Store(s) => s.read(buf).await,
            Self::Channel(c) => c.read(buf).await,
        }
    }

    /// # Errors
    /// See [`StoreSession::write`] and [`ChannelSession::write`].
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        match self {
            Self::Store(s) => s.write(data).await,
            Self::Channel(c) => c.write(data).await,
        }
    }

    /// # Errors
    /// `IllegalSeek` on a channel; see [`StoreSession::seek`].
    pub async fn seek(&self, delta: i64, whence: Whence) -> Result<u64> {
        match self {
            Self::Store(s) => s.seek(delta, whence).await,
            Self::Channel(_) => Err(DeviceError::IllegalSeek),
        }
    }

    /// Current readiness; a store is always readable and writable
    ///
    /// # Errors
    /// `Interrupted` while waiting for the channel lock.
    pub async fn poll(&self) -> Result<Readiness> {
        match self {
            Self::Store(_) => Ok(Readiness::READABLE | Readiness::WRITABLE),
            Self::Channel(c) => c.poll().await,
        }
    }

    /// Suspend until one of `interest` holds
    ///
    /// # Errors
    /// `Interrupted` if the session's interrupt fires first.
    pub async fn wait_ready(&self, interest: Readiness) -> Result<Readiness> {
        match self {
            Self::Store(_) => Ok(Readiness::READABLE | Readiness::WRITABLE),
            Self::Channel(c) => c.wait_ready(interest).await,
        }
    }

    /// Run a control opcode against the session's device
    ///
    /// # Errors
    /// See [`crate::control::dispatch`].
    pub async fn control(
        &self,
        op: Opcode,
        arg: ControlArg<'_>,
        creds: Credentials,
    ) -> Result<i64> {
        tracing::debug!(session = %self.id(), device = %self.device_id(), ?op, "control");
        match self {
            Self::Store(s) => s.control(op, arg, creds).await,
            Self::Channel(c) => c.control(op, arg, creds),
        }
    }

    /// Enable or disable asynchronous "readable" notification
    ///
    /// # Errors
    /// `InvalidArgument` on a store, which never signals.
    pub fn set_async(&self, enable: bool) -> Result<()> {
        match self {
            Self::Store(_) => Err(DeviceError::invalid(
                "asynchronous notification is only available on channels",
            )),
            Self::Channel(c) => {
                c.set_async(enable);
                Ok(())
            }
        }
    }

    /// # Errors
    /// `InvalidArgument` on a store; `Interrupted` if the interrupt fires.
    pub async fn next_signal(&self) -> Result<Signal> {
        match self {
            Self::Store(_) => Err(DeviceError::invalid("stores deliver no signals")),
            Self::Channel(c) => c.next_signal().await,
        }
    }

    #[must_use]
    pub fn try_next_signal(&self) -> Option<Signal> {
        match self {
            Self::Store(_) => None,
            Self::Channel(c) => c.try_next_signal(),
        }
    }
}
