pub mod alloc;
pub mod channel;
pub mod config;
pub mod control;
pub mod devfs;
pub mod error;
pub mod idgen;
pub mod interrupt;
pub mod session;
pub mod sparse;
pub mod store;
pub mod table;
pub mod waitq;

// Re-export error types for convenience
pub use error::{DeviceError, Result};

// Re-export device types for convenience
pub use alloc::SlotAllocator;
pub use channel::{ChannelDevice, ChannelSession};
pub use sparse::{SparseStore, Whence};
pub use store::{StoreDevice, StoreSession};

// Re-export session and table types
pub use config::DeviceConfig;
pub use session::{AccessMode, Readiness, Session};
pub use table::{DeviceId, DeviceTable, OpenOptions};

// Re-export control surface
pub use control::{ControlArg, Credentials, Opcode, Param, Tunables};

// Re-export driver and cancellation
pub use devfs::DevFs;
pub use idgen::{IdGen, SessionId};
pub use interrupt::{Interrupt, InterruptSource};
pub use waitq::Signal;
