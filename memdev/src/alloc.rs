//! Zeroed chunk allocation for the sparse store
//!
//! Every piece of sparse-store memory (a quantum, the slot array of a
//! quantum set, the set itself) is charged against a shared budget. The
//! charge travels with the allocation and is returned when it is dropped,
//! so trimming a store is just dropping its sets.
//!
//! An unbounded allocator only fails when the process allocator does; a
//! bounded one fails deterministically once the budget is spent, which is
//! how the out-of-memory paths are exercised.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{DeviceError, Result};

struct Budget {
    limit: Option<usize>,
    in_use: AtomicUsize,
}

/// Shared, cloneable allocator handle
#[derive(Clone)]
pub struct SlotAllocator {
    budget: Arc<Budget>,
}

impl SlotAllocator {
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            budget: Arc::new(Budget {
                limit: None,
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// An allocator that refuses to hand out more than `bytes` in total
    #[must_use]
    pub fn with_limit(bytes: usize) -> Self {
        Self {
            budget: Arc::new(Budget {
                limit: Some(bytes),
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Bytes currently charged against the budget
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.budget.in_use.load(Ordering::Acquire)
    }

    /// Charge `bytes` against the budget
    ///
    /// # Errors
    /// `OutOfMemory` if the budget would be exceeded.
    pub fn reserve(&self, bytes: usize) -> Result<Reservation> {
        let budget = &self.budget;
        let mut current = budget.in_use.load(Ordering::Relaxed);
        loop {
            let next = current.checked_add(bytes).ok_or(DeviceError::OutOfMemory)?;
            if budget.limit.is_some_and(|limit| next > limit) {
                log::debug!("alloc: refusing {bytes} bytes ({current} in use)");
                return Err(DeviceError::OutOfMemory);
            }
            match budget.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Ok(Reservation {
            alloc: self.clone(),
            bytes,
        })
    }

    /// Allocate one zero-filled quantum of `size` bytes
    ///
    /// # Errors
    /// `OutOfMemory` if the budget or the process allocator refuses.
    pub fn quantum(&self, size: usize) -> Result<Quantum> {
        let charge = self.reserve(size)?;
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| DeviceError::OutOfMemory)?;
        data.resize(size, 0);
        Ok(Quantum {
            data: data.into_boxed_slice(),
            _charge: charge,
        })
    }

    /// Allocate an array of `len` empty quantum owners
    ///
    /// # Errors
    /// `OutOfMemory` if the budget or the process allocator refuses.
    pub fn slot_array(&self, len: usize) -> Result<SlotArray> {
        let bytes = len
            .checked_mul(std::mem::size_of::<Option<Quantum>>())
            .ok_or(DeviceError::OutOfMemory)?;
        let charge = self.reserve(bytes)?;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(len)
            .map_err(|_| DeviceError::OutOfMemory)?;
        slots.resize_with(len, || None);
        Ok(SlotArray { slots, charge })
    }

    fn release(&self, bytes: usize) {
        self.budget.in_use.fetch_sub(bytes, Ordering::AcqRel);
    }
}

impl fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SlotAllocator(in_use={}, limit={:?})",
            self.in_use(),
            self.budget.limit
        )
    }
}

/// Bytes charged against an allocator; returned on drop
pub struct Reservation {
    alloc: SlotAllocator,
    bytes: usize,
}

impl Reservation {
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Take over another reservation's charge
    fn absorb(&mut self, mut other: Reservation) {
        self.bytes += std::mem::take(&mut other.bytes);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.alloc.release(self.bytes);
    }
}

/// One zero-initialized chunk of sparse-store data
pub struct Quantum {
    data: Box<[u8]>,
    _charge: Reservation,
}

impl Deref for Quantum {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Quantum {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// The chunk-owner array of one quantum set
pub struct SlotArray {
    slots: Vec<Option<Quantum>>,
    charge: Reservation,
}

impl SlotArray {
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&Quantum> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// The quantum at `slot`, allocating it (zeroed, `size` bytes) if absent
    ///
    /// The array grows first if `slot` lies beyond it, which only happens
    /// after the set size was raised while data was stored.
    ///
    /// # Errors
    /// `OutOfMemory` if either allocation fails; nothing is changed then.
    pub fn get_or_alloc(&mut self, slot: usize, size: usize) -> Result<&mut Quantum> {
        if slot >= self.slots.len() {
            self.grow(slot + 1)?;
        }
        let alloc = self.charge.alloc.clone();
        let entry = &mut self.slots[slot];
        let fresh = match entry.as_ref() {
            None => Some(alloc.quantum(size)?),
            // Quantum size was raised after this chunk was allocated
            Some(old) if old.len() < size => {
                let mut bigger = alloc.quantum(size)?;
                bigger[..old.len()].copy_from_slice(old);
                Some(bigger)
            }
            Some(_) => None,
        };
        match fresh {
            Some(quantum) => Ok(entry.insert(quantum)),
            None => entry.as_mut().ok_or(DeviceError::OutOfMemory),
        }
    }

    /// Number of quanta currently allocated in this array
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn grow(&mut self, len: usize) -> Result<()> {
        let extra = len - self.slots.len();
        let bytes = extra * std::mem::size_of::<Option<Quantum>>();
        let charge = self.charge.alloc.reserve(bytes)?;
        self.slots
            .try_reserve_exact(extra)
            .map_err(|_| DeviceError::OutOfMemory)?;
        self.slots.resize_with(len, || None);
        self.charge.absorb(charge);
        Ok(())
    }
}
