//! Error type shared by the device backends
//!
//! Every failure is local to the operation and the handle it was issued on.
//! Nothing is retried internally: the caller decides whether to retry
//! (`WouldBlock`, `Interrupted`) or give up.

use std::io;

/// Errors reported by device operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Non-blocking handle and the operation cannot proceed right now
    #[error("operation would block")]
    WouldBlock,

    /// The session's interrupt was raised while waiting
    #[error("interrupted while waiting")]
    Interrupted,

    /// Allocation failed while growing device storage
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Privileged control operation without the administrative capability
    #[error("operation not permitted")]
    PermissionDenied,

    /// Copy between the caller's memory and the device failed
    #[error("bad address")]
    CopyFault,

    #[error("no such device: {0}")]
    NoSuchDevice(String),

    /// Seek on a device that has no file position
    #[error("illegal seek")]
    IllegalSeek,

    /// Read on a write-only handle or write on a read-only one
    #[error("bad access mode for this operation")]
    BadAccessMode,

    /// The driver's descriptor table is full
    #[error("too many open descriptors")]
    TooManyOpen,
}

pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Classic errno value for this error
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::WouldBlock => 11, // EAGAIN
            Self::Interrupted => 4, // EINTR
            Self::OutOfMemory => 12, // ENOMEM
            Self::InvalidArgument(_) => 22, // EINVAL
            Self::PermissionDenied => 1, // EPERM
            Self::CopyFault => 14, // EFAULT
            Self::NoSuchDevice(_) => 19, // ENODEV
            Self::IllegalSeek => 29, // ESPIPE
            Self::BadAccessMode => 9, // EBADF
            Self::TooManyOpen => 24, // EMFILE
        }
    }

    /// Whether retrying the same call later can succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::Interrupted)
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl embedded_io_async::Error for DeviceError {
    fn kind(&self) -> embedded_io_async::ErrorKind {
        use embedded_io_async::ErrorKind;
        match self {
            Self::Interrupted => ErrorKind::Interrupted,
            Self::OutOfMemory => ErrorKind::OutOfMemory,
            Self::InvalidArgument(_) => ErrorKind::InvalidInput,
            Self::PermissionDenied | Self::BadAccessMode => ErrorKind::PermissionDenied,
            Self::NoSuchDevice(_) => ErrorKind::NotFound,
            Self::IllegalSeek => ErrorKind::Unsupported,
            Self::WouldBlock | Self::CopyFault | Self::TooManyOpen => ErrorKind::Other,
        }
    }
}

impl From<DeviceError> for io::Error {
    fn from(e: DeviceError) -> Self {
        let kind = match &e {
            DeviceError::WouldBlock => io::ErrorKind::WouldBlock,
            DeviceError::Interrupted => io::ErrorKind::Interrupted,
            DeviceError::OutOfMemory => io::ErrorKind::OutOfMemory,
            DeviceError::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            DeviceError::PermissionDenied | DeviceError::BadAccessMode => {
                io::ErrorKind::PermissionDenied
            }
            DeviceError::CopyFault | DeviceError::TooManyOpen => io::ErrorKind::Other,
            DeviceError::NoSuchDevice(_) => io::ErrorKind::NotFound,
            DeviceError::IllegalSeek => io::ErrorKind::Unsupported,
        };
        io::Error::new(kind, e)
    }
}
