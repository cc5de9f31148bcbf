//! Instance pools created at startup

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::alloc::SlotAllocator;
use crate::channel::ChannelDevice;
use crate::config::DeviceConfig;
use crate::error::{DeviceError, Result};
use crate::idgen::IdGen;
use crate::interrupt::Interrupt;
use crate::session::{AccessMode, Session};
use crate::store::StoreDevice;

/// Address of one device instance: `store<N>` or `chan<N>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceId {
    Store(usize),
    Channel(usize),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(n) => write!(f, "store{n}"),
            Self::Channel(n) => write!(f, "chan{n}"),
        }
    }
}

impl FromStr for DeviceId {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |digits: &str, make: fn(usize) -> Self| {
            digits
                .parse::<usize>()
                .map(make)
                .map_err(|_| DeviceError::NoSuchDevice(s.to_string()))
        };
        if let Some(digits) = s.strip_prefix("store") {
            parse(digits, Self::Store)
        } else if let Some(digits) = s.strip_prefix("chan") {
            parse(digits, Self::Channel)
        } else {
            Err(DeviceError::NoSuchDevice(s.to_string()))
        }
    }
}

/// How to open an instance
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub mode: AccessMode,
    pub nonblocking: bool,
    pub interrupt: Interrupt,
}

impl OpenOptions {
    #[must_use]
    pub fn new(mode: AccessMode) -> Self {
        Self {
            mode,
            nonblocking: false,
            interrupt: Interrupt::never(),
        }
    }

    #[must_use]
    pub fn nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    #[must_use]
    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }
}

/// The fixed pools of stores and channels
pub struct DeviceTable {
    config: DeviceConfig,
    stores: Vec<Arc<StoreDevice>>,
    channels: Vec<Arc<ChannelDevice>>,
    ids: IdGen,
    alloc: SlotAllocator,
}

impl DeviceTable {
    /// # Errors
    /// `InvalidArgument` if the configuration is invalid.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        Self::with_allocator(config, SlotAllocator::unbounded())
    }

    /// A table whose stores draw from `alloc`
    ///
    /// # Errors
    /// `InvalidArgument` if the configuration is invalid.
    pub fn with_allocator(config: DeviceConfig, alloc: SlotAllocator) -> Result<Self> {
        config.validate()?;
        let stores = (0..config.store_count)
            .map(|i| StoreDevice::new(i, config.quantum, config.qset, alloc.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let channels = (0..config.channel_count)
            .map(|i| ChannelDevice::new(i, config.channel_capacity).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        info!(
            stores = stores.len(),
            channels = channels.len(),
            quantum = config.quantum,
            qset = config.qset,
            capacity = config.channel_capacity,
            "device table ready"
        );
        Ok(Self {
            config,
            stores,
            channels,
            ids: IdGen::new(),
            alloc,
        })
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub fn allocator(&self) -> &SlotAllocator {
        &self.alloc
    }

    /// # Errors
    /// `NoSuchDevice` if the index is out of range.
    pub fn store(&self, index: usize) -> Result<&Arc<StoreDevice>> {
        self.stores
            .get(index)
            .ok_or_else(|| DeviceError::NoSuchDevice(DeviceId::Store(index).to_string()))
    }

    /// # Errors
    /// `NoSuchDevice` if the index is out of range.
    pub fn channel(&self, index: usize) -> Result<&Arc<ChannelDevice>> {
        self.channels
            .get(index)
            .ok_or_else(|| DeviceError::NoSuchDevice(DeviceId::Channel(index).to_string()))
    }

    /// Every instance address, stores first
    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        (0..self.stores.len())
            .map(DeviceId::Store)
            .chain((0..self.channels.len()).map(DeviceId::Channel))
    }

    /// Open a session on `id`
    ///
    /// # Errors
    /// `NoSuchDevice` for an unknown instance, `Interrupted` if the open is
    /// interrupted while waiting for the instance lock, `OutOfMemory`
    /// if a channel buffer cannot be allocated.
    pub async fn open(&self, id: DeviceId, options: &OpenOptions) -> Result<Session> {
        let session_id = self.ids.get_next();
        let session = match id {
            DeviceId::Store(i) => Session::Store(
                self.store(i)?
                    .open(
                        session_id,
                        options.mode,
                        options.nonblocking,
                        options.interrupt.clone(),
                    )
                    .await?,
            ),
            DeviceId::Channel(i) => Session::Channel(
                self.channel(i)?
                    .open(
                        session_id,
                        options.mode,
                        options.nonblocking,
                        options.interrupt.clone(),
                    )
                    .await?,
            ),
        };
        debug!(device = %id, session = %session_id, mode = ?options.mode, nonblocking = options.nonblocking, "opened");
        Ok(session)
    }

    /// Release the data of every store
    pub async fn shutdown(&self) {
        for store in &self.stores {
            trace!(device = %DeviceId::Store(store.index()), "trimming");
            store.trim().await;
        }
        info!(in_use = self.alloc.in_use(), "device table shut down");
    }
}

impl fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTable")
            .field("config", &self.config)
            .field("alloc", &self.alloc)
            .finish_non_exhaustive()
    }
}
