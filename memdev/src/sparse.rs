//! Sparse, lazily-growing byte store
//!
//! The store is a sequence of quantum sets. Set `i` covers the byte range
//! `[i * item_size, (i + 1) * item_size)` where `item_size = quantum * qset`.
//! Each set owns an optional array of `qset` optional quanta of `quantum`
//! bytes. Nothing is allocated until a write touches it, and one call
//! never crosses a quantum boundary.

use crate::alloc::{Reservation, SlotAllocator, SlotArray};
use crate::error::{DeviceError, Result};

/// Base for [`SparseStore::seek`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Absolute,
    Relative,
    FromEnd,
}

/// One node of the store, covering `quantum * qset` bytes
pub struct QuantumSet {
    slots: Option<SlotArray>,
    _node: Reservation,
}

impl QuantumSet {
    /// The chunk-owner array, if any write has touched this set
    #[must_use]
    pub fn slots(&self) -> Option<&SlotArray> {
        self.slots.as_ref()
    }
}

/// Position of a byte inside the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Location {
    item: usize,
    slot: usize,
    chunk_off: usize,
}

pub struct SparseStore {
    sets: Vec<QuantumSet>,
    size: u64,
    quantum: usize,
    qset: usize,
    alloc: SlotAllocator,
}

impl SparseStore {
    /// An empty store with the given dimensions
    ///
    /// # Errors
    /// `InvalidArgument` if a dimension is zero or their product overflows.
    pub fn new(quantum: usize, qset: usize, alloc: SlotAllocator) -> Result<Self> {
        check_dimensions(quantum, qset)?;
        Ok(Self {
            sets: Vec::new(),
            size: 0,
            quantum,
            qset,
            alloc,
        })
    }

    /// Bytes of valid data
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn quantum(&self) -> usize {
        self.quantum
    }

    #[must_use]
    pub fn qset(&self) -> usize {
        self.qset
    }

    /// Bytes covered by one quantum set
    #[must_use]
    pub fn item_size(&self) -> u64 {
        // Checked when the dimensions were set
        (self.quantum as u64) * (self.qset as u64)
    }

    /// Number of linked quantum sets
    #[must_use]
    pub fn allocated_sets(&self) -> usize {
        self.sets.len()
    }

    /// Number of allocated quanta over all sets
    #[must_use]
    pub fn allocated_quanta(&self) -> usize {
        self.sets
            .iter()
            .filter_map(QuantumSet::slots)
            .map(SlotArray::allocated)
            .sum()
    }

    /// Change the quantum size
    ///
    /// Data already stored keeps its old layout; offsets computed with the
    /// new size may land elsewhere.
    ///
    /// # Errors
    /// `InvalidArgument` if the value is zero or `quantum * qset` overflows.
    pub fn set_quantum(&mut self, quantum: usize) -> Result<()> {
        check_dimensions(quantum, self.qset)?;
        if !self.sets.is_empty() {
            log::warn!(
                "sparse.set_quantum: {} -> {quantum} with {} bytes stored",
                self.quantum,
                self.size
            );
        }
        self.quantum = quantum;
        Ok(())
    }

    /// Change the number of quanta per set
    ///
    /// # Errors
    /// `InvalidArgument` if the value is zero or `quantum * qset` overflows.
    pub fn set_qset(&mut self, qset: usize) -> Result<()> {
        check_dimensions(self.quantum, qset)?;
        if !self.sets.is_empty() {
            log::warn!(
                "sparse.set_qset: {} -> {qset} with {} bytes stored",
                self.qset,
                self.size
            );
        }
        self.qset = qset;
        Ok(())
    }

    /// Change both dimensions at once
    ///
    /// # Errors
    /// `InvalidArgument` as for [`SparseStore::set_quantum`].
    pub fn set_dimensions(&mut self, quantum: usize, qset: usize) -> Result<()> {
        check_dimensions(quantum, qset)?;
        self.quantum = quantum;
        self.qset = qset;
        Ok(())
    }

    /// Release all data; the store becomes empty
    pub fn trim(&mut self) {
        if !self.sets.is_empty() {
            log::debug!(
                "sparse.trim: releasing {} sets, {} bytes",
                self.sets.len(),
                self.size
            );
        }
        self.sets = Vec::new();
        self.size = 0;
    }

    /// The `index`-th quantum set, linking empty sets up to it as needed
    ///
    /// # Errors
    /// `OutOfMemory` if a set cannot be allocated. Sets linked before the
    /// failure stay linked.
    pub fn follow(&mut self, index: usize) -> Result<&mut QuantumSet> {
        if index >= self.sets.len() {
            let missing = (index - self.sets.len()).saturating_add(1);
            self.sets
                .try_reserve(missing)
                .map_err(|_| DeviceError::OutOfMemory)?;
            while self.sets.len() <= index {
                let node = self.alloc.reserve(std::mem::size_of::<QuantumSet>())?;
                self.sets.push(QuantumSet {
                    slots: None,
                    _node: node,
                });
            }
        }
        Ok(&mut self.sets[index])
    }

    /// Copy bytes at `offset` into `buf`, without crossing a quantum
    ///
    /// Returns 0 at or past the end of data and for holes that were never
    /// written.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> usize {
        if offset >= self.size || buf.is_empty() {
            return 0;
        }
        let Some(loc) = self.locate(offset) else {
            return 0;
        };
        let remaining = self.size - offset;
        let quantum = self.quantum;
        let set = match self.follow(loc.item) {
            Ok(set) => set,
            Err(e) => {
                log::warn!("sparse.read: set {} unavailable: {e}", loc.item);
                return 0;
            }
        };
        let Some(chunk) = set.slots.as_ref().and_then(|slots| slots.get(loc.slot)) else {
            return 0;
        };
        // A chunk allocated before the quantum was raised is shorter
        let available = chunk.len().min(quantum).saturating_sub(loc.chunk_off);
        let count = clamp(buf.len(), available, remaining);
        buf[..count].copy_from_slice(&chunk[loc.chunk_off..loc.chunk_off + count]);
        count
    }

    /// Copy `data` into the store at `offset`, without crossing a quantum
    ///
    /// Allocates the set, its chunk array and the chunk as needed.
    ///
    /// # Errors
    /// `OutOfMemory` if any allocation fails. Nothing is written then, but
    /// sets linked along the way are kept.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let loc = self.locate(offset).ok_or(DeviceError::OutOfMemory)?;
        let quantum = self.quantum;
        let qset = self.qset;
        let alloc = self.alloc.clone();

        let set = self.follow(loc.item)?;
        if set.slots.is_none() {
            set.slots = Some(alloc.slot_array(qset)?);
        }
        let Some(slots) = set.slots.as_mut() else {
            return Err(DeviceError::OutOfMemory);
        };
        let chunk = slots.get_or_alloc(loc.slot, quantum)?;

        let count = data.len().min(quantum - loc.chunk_off);
        chunk[loc.chunk_off..loc.chunk_off + count].copy_from_slice(&data[..count]);

        let end = offset + count as u64;
        if end > self.size {
            self.size = end;
        }
        Ok(count)
    }

    /// Compute a new position from `current`
    ///
    /// # Errors
    /// `InvalidArgument` if the result is negative or does not fit.
    pub fn seek(&self, current: u64, delta: i64, whence: Whence) -> Result<u64> {
        let base = match whence {
            Whence::Absolute => 0,
            Whence::Relative => i128::from(current),
            Whence::FromEnd => i128::from(self.size),
        };
        let target = base + i128::from(delta);
        if target < 0 {
            return Err(DeviceError::invalid(format!("seek to negative offset {target}")));
        }
        u64::try_from(target).map_err(|_| DeviceError::invalid("seek past the addressable range"))
    }

    fn locate(&self, offset: u64) -> Option<Location> {
        let item_size = self.item_size();
        let item = usize::try_from(offset / item_size).ok()?;
        // rest < item_size, which fits usize
        let rest = (offset % item_size) as usize;
        Some(Location {
            item,
            slot: rest / self.quantum,
            chunk_off: rest % self.quantum,
        })
    }
}

impl std::fmt::Debug for SparseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseStore")
            .field("size", &self.size)
            .field("quantum", &self.quantum)
            .field("qset", &self.qset)
            .field("sets", &self.sets.len())
            .finish_non_exhaustive()
    }
}

fn clamp(wanted: usize, available: usize, remaining: u64) -> usize {
    let remaining = usize::try_from(remaining).unwrap_or(usize::MAX);
    wanted.min(available).min(remaining)
}

/// Validate a `(quantum, qset)` pair
///
/// # Errors
/// `InvalidArgument` if either is zero or their product overflows.
pub fn check_dimensions(quantum: usize, qset: usize) -> Result<()> {
    if quantum == 0 || qset == 0 {
        return Err(DeviceError::invalid(format!(
            "quantum and qset must be positive (got {quantum}, {qset})"
        )));
    }
    if quantum.checked_mul(qset).is_none() {
        return Err(DeviceError::invalid(format!(
            "quantum * qset overflows ({quantum} * {qset})"
        )));
    }
    Ok(())
}
