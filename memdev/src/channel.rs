//! Bounded circular channel
//!
//! Any number of reader and writer sessions share one ring buffer of
//! `capacity` bytes. `rp == wp` means empty, so at most `capacity - 1`
//! bytes are buffered. Readers block while the ring is empty, writers
//! block while it is full, and every successful write tells the
//! asynchronously-subscribed sessions that data is available.
//!
//! The buffer is allocated by the first open and shared by the sessions;
//! it is freed when the last session is dropped. Every open resets both
//! cursors, discarding whatever was buffered. A capacity change only
//! takes effect at the next allocation.
//!
//! A single call never wraps: a write stops at the end of the buffer and
//! a following call continues at its start.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::future::select_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::control::{self, ControlArg, Credentials, Opcode, Param, Tunables};
use crate::error::{DeviceError, Result};
use crate::idgen::SessionId;
use crate::interrupt::Interrupt;
use crate::session::{AccessMode, Readiness};
use crate::waitq::{Notifier, Signal, WaitSet};

/// Smallest usable capacity: one byte of data plus the empty marker
pub const MIN_CAPACITY: usize = 2;

/// Validate a channel capacity
///
/// # Errors
/// `InvalidArgument` if it is below [`MIN_CAPACITY`].
pub fn check_capacity(capacity: usize) -> Result<()> {
    if capacity < MIN_CAPACITY {
        return Err(DeviceError::invalid(format!(
            "channel capacity must be at least {MIN_CAPACITY} (got {capacity})"
        )));
    }
    Ok(())
}

// ============================================================================
// Ring state
// ============================================================================

struct RingState {
    buffer: Box<[u8]>,
    rp: usize,
    wp: usize,
    /// Readers blocked on an empty ring
    inq: WaitSet,
    /// Writers blocked on a full ring
    outq: WaitSet,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn is_empty(&self) -> bool {
        self.rp == self.wp
    }

    fn buffered(&self) -> usize {
        (self.wp + self.capacity() - self.rp) % self.capacity()
    }

    fn space_free(&self) -> usize {
        let cap = self.capacity();
        if self.rp == self.wp {
            return cap - 1;
        }
        (self.rp + cap - self.wp) % cap - 1
    }

    fn readiness(&self) -> Readiness {
        let mut ready = Readiness::empty();
        if !self.is_empty() {
            ready |= Readiness::READABLE;
        }
        if self.space_free() > 0 {
            ready |= Readiness::WRITABLE;
        }
        ready
    }

    /// Copy out of the ring; the ring must not be empty
    fn take_into(&mut self, buf: &mut [u8]) -> usize {
        let cap = self.capacity();
        let rp = self.rp;
        let count = if self.wp > rp {
            buf.len().min(self.wp - rp)
        } else {
            buf.len().min(cap - rp)
        };
        buf[..count].copy_from_slice(&self.buffer[rp..rp + count]);
        self.rp = (rp + count) % cap;
        count
    }

    /// Copy into the ring; there must be free space
    fn put_from(&mut self, data: &[u8]) -> usize {
        let cap = self.capacity();
        let wp = self.wp;
        let mut count = data.len().min(self.space_free());
        if wp >= self.rp {
            count = count.min(cap - wp);
        } else {
            count = count.min(self.rp - wp - 1);
        }
        self.buffer[wp..wp + count].copy_from_slice(&data[..count]);
        self.wp = (wp + count) % cap;
        count
    }
}

/// The shared ring buffer plus its open-handle counts
pub struct Ring {
    channel: usize,
    state: tokio::sync::Mutex<RingState>,
    readers: AtomicUsize,
    writers: AtomicUsize,
}

impl Ring {
    fn allocate(channel: usize, capacity: usize) -> Result<Self> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(capacity)
            .map_err(|_| DeviceError::OutOfMemory)?;
        buffer.resize(capacity, 0);
        log::debug!("chan{channel}: allocated {capacity} byte buffer");
        Ok(Self {
            channel,
            state: tokio::sync::Mutex::new(RingState {
                buffer: buffer.into_boxed_slice(),
                rp: 0,
                wp: 0,
                inq: WaitSet::new("channel.readers"),
                outq: WaitSet::new("channel.writers"),
            }),
            readers: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
        })
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        log::debug!("chan{}: last handle gone, buffer released", self.channel);
    }
}

/// A session's share of the ring and its reader/writer count
struct Membership {
    ring: Arc<Ring>,
    reader: bool,
    writer: bool,
}

impl Membership {
    fn join(ring: Arc<Ring>, mode: AccessMode) -> Self {
        let reader = mode.can_read();
        let writer = mode.can_write();
        if reader {
            ring.readers.fetch_add(1, Ordering::AcqRel);
        }
        if writer {
            ring.writers.fetch_add(1, Ordering::AcqRel);
        }
        Self {
            ring,
            reader,
            writer,
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if self.reader {
            self.ring.readers.fetch_sub(1, Ordering::AcqRel);
        }
        if self.writer {
            self.ring.writers.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

// ============================================================================
// Device
// ============================================================================

struct ChannelSlot {
    ring: Weak<Ring>,
    pending_capacity: usize,
}

/// One circular channel instance
pub struct ChannelDevice {
    index: usize,
    default_capacity: usize,
    slot: Mutex<ChannelSlot>,
    notifier: Notifier,
}

impl ChannelDevice {
    /// # Errors
    /// `InvalidArgument` if `capacity` is too small.
    pub fn new(index: usize, capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;
        Ok(Self {
            index,
            default_capacity: capacity,
            slot: Mutex::new(ChannelSlot {
                ring: Weak::new(),
                pending_capacity: capacity,
            }),
            notifier: Notifier::new(index),
        })
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Capacity the next buffer allocation will use
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slot.lock().pending_capacity
    }

    /// Set the capacity for the next buffer allocation
    ///
    /// # Errors
    /// `InvalidArgument` if `capacity` is too small.
    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        check_capacity(capacity)?;
        let mut slot = self.slot.lock();
        if slot.ring.strong_count() > 0 {
            log::debug!(
                "chan{}: capacity {capacity} deferred until the buffer is reallocated",
                self.index
            );
        }
        slot.pending_capacity = capacity;
        Ok(())
    }

    /// Restore the configured capacity
    pub fn reset_capacity(&self) {
        self.slot.lock().pending_capacity = self.default_capacity;
    }

    /// Whether a buffer currently exists
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.slot.lock().ring.strong_count() > 0
    }

    /// Open reader handles
    #[must_use]
    pub fn readers(&self) -> usize {
        self.ring()
            .map_or(0, |ring| ring.readers.load(Ordering::Acquire))
    }

    /// Open writer handles
    #[must_use]
    pub fn writers(&self) -> usize {
        self.ring()
            .map_or(0, |ring| ring.writers.load(Ordering::Acquire))
    }

    /// Sessions subscribed to asynchronous notification
    #[must_use]
    pub fn subscribers(&self) -> usize {
        self.notifier.len()
    }

    fn ring(&self) -> Option<Arc<Ring>> {
        self.slot.lock().ring.upgrade()
    }

    /// Open a session, allocating the buffer if this is the first one
    ///
    /// Every open empties the channel: both cursors go back to the start
    /// of the buffer and blocked writers are woken to recheck.
    ///
    /// # Errors
    /// `OutOfMemory` if the buffer cannot be allocated, `Interrupted` if
    /// the interrupt fires while waiting for the buffer lock.
    pub async fn open(
        self: &Arc<Self>,
        id: SessionId,
        mode: AccessMode,
        nonblocking: bool,
        interrupt: Interrupt,
    ) -> Result<ChannelSession> {
        let (member, joined) = {
            let mut slot = self.slot.lock();
            match slot.ring.upgrade() {
                Some(ring) => (Membership::join(ring, mode), true),
                None => {
                    let ring = Arc::new(Ring::allocate(self.index, slot.pending_capacity)?);
                    slot.ring = Arc::downgrade(&ring);
                    (Membership::join(ring, mode), false)
                }
            }
        };
        if joined {
            // Dropping `member` on interrupt undoes the count
            let mut state = interrupt.guard(member.ring.state.lock()).await?;
            if !state.is_empty() {
                log::debug!(
                    "chan{}: open discards {} buffered bytes",
                    self.index,
                    state.buffered()
                );
            }
            state.rp = 0;
            state.wp = 0;
            let wakeups = state.outq.take();
            drop(state);
            wakeups.wake();
        }
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Ok(ChannelSession {
            id,
            mode,
            device: Arc::clone(self),
            member,
            nonblocking: AtomicBool::new(nonblocking),
            interrupt,
            signal_tx,
            signals: tokio::sync::Mutex::new(signal_rx),
            hint: format!("chan{} {id}", self.index),
        })
    }
}

impl Tunables for &ChannelDevice {
    fn get(&self, param: Param) -> Result<usize> {
        match param {
            Param::Capacity => Ok(self.capacity()),
            Param::Quantum | Param::Qset => Err(DeviceError::invalid(format!(
                "{param} is not a channel parameter"
            ))),
        }
    }

    fn set(&mut self, param: Param, value: usize) -> Result<()> {
        match param {
            Param::Capacity => self.set_capacity(value),
            Param::Quantum | Param::Qset => Err(DeviceError::invalid(format!(
                "{param} is not a channel parameter"
            ))),
        }
    }

    fn reset(&mut self) {
        self.reset_capacity();
    }
}

impl fmt::Debug for ChannelDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChannelDevice(chan{}, capacity={}, allocated={}, readers={}, writers={})",
            self.index,
            self.capacity(),
            self.is_allocated(),
            self.readers(),
            self.writers()
        )
    }
}

// ============================================================================
// Session
// ============================================================================

/// An open handle on a circular channel
///
/// All methods take `&self`: one session may be shared by a reading task
/// and a writing task at the same time.
pub struct ChannelSession {
    id: SessionId,
    mode: AccessMode,
    device: Arc<ChannelDevice>,
    member: Membership,
    nonblocking: AtomicBool,
    interrupt: Interrupt,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signals: tokio::sync::Mutex<mpsc::UnboundedReceiver<Signal>>,
    hint: String,
}

impl ChannelSession {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    #[must_use]
    pub fn device(&self) -> &Arc<ChannelDevice> {
        &self.device
    }

    #[must_use]
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Acquire)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Release);
    }

    /// Size of the buffer this session is attached to
    pub async fn buffer_capacity(&self) -> Result<usize> {
        Ok(self.lock().await?.capacity())
    }

    /// Bytes that can be written right now
    pub async fn space_free(&self) -> Result<usize> {
        Ok(self.lock().await?.space_free())
    }

    /// Bytes waiting to be read
    pub async fn buffered(&self) -> Result<usize> {
        Ok(self.lock().await?.buffered())
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, RingState>> {
        self.interrupt.guard(self.member.ring.state.lock()).await
    }

    /// Read up to `buf.len()` bytes, blocking while the ring is empty
    ///
    /// # Errors
    /// `BadAccessMode` on a write-only session, `WouldBlock` if the ring
    /// is empty and the session is non-blocking, `Interrupted` if the
    /// interrupt fires while waiting.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.mode.check_read()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.lock().await?;
        while state.is_empty() {
            if self.is_nonblocking() {
                return Err(DeviceError::WouldBlock);
            }
            let ticket = state.inq.register(&self.hint);
            drop(state);
            log::debug!("{}: reader waits for data", self.hint);
            self.interrupt.guard(ticket.wait()).await?;
            state = self.lock().await?;
        }
        let count = state.take_into(buf);
        let wakeups = state.outq.take();
        drop(state);

        wakeups.wake();
        Ok(count)
    }

    /// Write up to `data.len()` bytes, blocking while the ring is full
    ///
    /// Stops at the end of the buffer or one byte short of the reader.
    ///
    /// # Errors
    /// `BadAccessMode` on a read-only session, `WouldBlock` if the ring is
    /// full and the session is non-blocking, `Interrupted` if the
    /// interrupt fires while waiting.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.mode.check_write()?;
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.lock().await?;
        while state.space_free() == 0 {
            if self.is_nonblocking() {
                return Err(DeviceError::WouldBlock);
            }
            let ticket = state.outq.register(&self.hint);
            drop(state);
            log::debug!("{}: writer waits for space", self.hint);
            self.interrupt.guard(ticket.wait()).await?;
            state = self.lock().await?;
        }
        let count = state.put_from(data);
        let wakeups = state.inq.take();
        drop(state);

        // Notify outside the lock
        wakeups.wake();
        self.device.notifier.notify();
        Ok(count)
    }

    /// Current readiness, without waiting
    ///
    /// This is only a snapshot: `poll` does not put the session on the
    /// wait sets. Registration on both sets happens in
    /// [`ChannelSession::wait_ready`], which suspends until the state
    /// changes.
    ///
    /// # Errors
    /// `Interrupted` if the interrupt fires while waiting for the lock.
    pub async fn poll(&self) -> Result<Readiness> {
        Ok(self.lock().await?.readiness())
    }

    /// Suspend until one of `interest` holds and return the readiness
    ///
    /// # Errors
    /// `Interrupted` if the interrupt fires first.
    pub async fn wait_ready(&self, interest: Readiness) -> Result<Readiness> {
        loop {
            let mut state = self.lock().await?;
            let ready = state.readiness();
            if ready.intersects(interest) || interest.is_empty() {
                return Ok(ready);
            }
            let mut tickets = Vec::with_capacity(2);
            if interest.intersects(Readiness::READABLE) {
                tickets.push(Box::pin(state.inq.register(&self.hint).wait()));
            }
            if interest.intersects(Readiness::WRITABLE) {
                tickets.push(Box::pin(state.outq.register(&self.hint).wait()));
            }
            drop(state);
            if tickets.is_empty() {
                return Ok(ready);
            }
            self.interrupt.guard(select_all(tickets)).await?;
        }
    }

    /// Run a control opcode against this channel
    ///
    /// # Errors
    /// See [`control::dispatch`].
    pub fn control(&self, op: Opcode, arg: ControlArg<'_>, creds: Credentials) -> Result<i64> {
        let mut target: &ChannelDevice = &self.device;
        control::dispatch(op, arg, creds, &mut target)
    }

    /// Enable or disable asynchronous "readable" notification
    pub fn set_async(&self, enable: bool) {
        if enable {
            self.device.notifier.subscribe(self.id, self.signal_tx.clone());
        } else {
            self.device.notifier.unsubscribe(self.id);
        }
    }

    /// Next notification delivered to this session
    ///
    /// # Errors
    /// `Interrupted` if the interrupt fires first.
    pub async fn next_signal(&self) -> Result<Signal> {
        let mut signals = self.interrupt.guard(self.signals.lock()).await?;
        match self.interrupt.guard(signals.recv()).await? {
            Some(signal) => Ok(signal),
            // The session holds a sender itself
            None => Err(DeviceError::Interrupted),
        }
    }

    /// A notification that is already pending, if any
    #[must_use]
    pub fn try_next_signal(&self) -> Option<Signal> {
        self.signals.try_lock().ok()?.try_recv().ok()
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        if self.device.notifier.unsubscribe(self.id) {
            log::debug!("{}: async notification removed on close", self.hint);
        }
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChannelSession({}, mode={:?}, nonblocking={})",
            self.hint,
            self.mode,
            self.is_nonblocking()
        )
    }
}

impl embedded_io_async::ErrorType for ChannelSession {
    type Error = DeviceError;
}

impl embedded_io_async::Read for ChannelSession {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        ChannelSession::read(self, buf).await
    }
}

impl embedded_io_async::Write for ChannelSession {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        ChannelSession::write(self, buf).await
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idgen::IdGen;
    use crate::interrupt::InterruptSource;
    use std::time::Duration;

    async fn open(dev: &Arc<ChannelDevice>, ids: &IdGen, nonblocking: bool) -> ChannelSession {
        dev.open(ids.get_next(), AccessMode::ReadWrite, nonblocking, Interrupt::never())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dev = Arc::new(ChannelDevice::new(0, 16).unwrap());
        let ids = IdGen::new();
        let s = open(&dev, &ids, true).await;

        assert_eq!(s.write(b"hello").await.unwrap(), 5);
        assert_eq!(s.buffered().await.unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(s.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(s.read(&mut buf).await, Err(DeviceError::WouldBlock));
    }

    #[tokio::test]
    async fn test_full_ring_keeps_one_byte_free() {
        let dev = Arc::new(ChannelDevice::new(0, 8).unwrap());
        let ids = IdGen::new();
        let s = open(&dev, &ids, true).await;

        assert_eq!(s.write(&[1u8; 20]).await.unwrap(), 7);
        assert_eq!(s.space_free().await.unwrap(), 0);
        assert_eq!(s.write(b"x").await, Err(DeviceError::WouldBlock));

        let mut one = [0u8; 1];
        assert_eq!(s.read(&mut one).await.unwrap(), 1);
        assert_eq!(s.space_free().await.unwrap(), 1);
        assert_eq!(s.write(b"x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_does_not_wrap_in_one_call() {
        let dev = Arc::new(ChannelDevice::new(0, 8).unwrap());
        let ids = IdGen::new();
        let s = open(&dev, &ids, true).await;
        let mut buf = [0u8; 8];

        s.write(b"abcde").await.unwrap();
        assert_eq!(s.read(&mut buf).await.unwrap(), 5);
        // rp = wp = 5: only 3 bytes until the end of the buffer
        assert_eq!(s.write(b"123456").await.unwrap(), 3);
        assert_eq!(s.write(b"456").await.unwrap(), 3);
        assert_eq!(s.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"123");
        assert_eq!(s.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"456");
    }

    #[tokio::test]
    async fn test_buffer_lifecycle_and_deferred_capacity() {
        let dev = Arc::new(ChannelDevice::new(3, 16).unwrap());
        let ids = IdGen::new();
        assert!(!dev.is_allocated());

        let reader = dev
            .open(ids.get_next(), AccessMode::ReadOnly, true, Interrupt::never())
            .await
            .unwrap();
        let writer = dev
            .open(ids.get_next(), AccessMode::WriteOnly, true, Interrupt::never())
            .await
            .unwrap();
        assert_eq!((dev.readers(), dev.writers()), (1, 1));

        dev.set_capacity(4).unwrap();
        assert_eq!(writer.buffer_capacity().await.unwrap(), 16);

        drop(reader);
        assert_eq!((dev.readers(), dev.writers()), (0, 1));
        drop(writer);
        assert!(!dev.is_allocated());

        let s = open(&dev, &ids, true).await;
        assert_eq!(s.buffer_capacity().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_access_mode_is_enforced() {
        let dev = Arc::new(ChannelDevice::new(0, 8).unwrap());
        let ids = IdGen::new();
        let reader = dev
            .open(ids.get_next(), AccessMode::ReadOnly, true, Interrupt::never())
            .await
            .unwrap();
        assert_eq!(reader.write(b"x").await, Err(DeviceError::BadAccessMode));
    }

    #[tokio::test]
    async fn test_blocked_reader_woken_by_writer() {
        let dev = Arc::new(ChannelDevice::new(0, 32).unwrap());
        let ids = IdGen::new();
        let reader = open(&dev, &ids, false).await;
        let writer = open(&dev, &ids, false).await;

        let task = tokio::spawn(async move {
            let mut buf = [0u8; 32];
            let n = reader.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.write(b"wake up").await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("reader was not woken")
            .unwrap();
        assert_eq!(got, b"wake up");
    }

    #[tokio::test]
    async fn test_open_resets_cursors() {
        let dev = Arc::new(ChannelDevice::new(0, 16).unwrap());
        let ids = IdGen::new();
        let a = open(&dev, &ids, true).await;
        a.write(b"abc").await.unwrap();
        assert_eq!(a.buffered().await.unwrap(), 3);

        let b = open(&dev, &ids, true).await;
        assert_eq!(b.buffered().await.unwrap(), 0);
        assert_eq!(a.space_free().await.unwrap(), 15);
        let mut buf = [0u8; 4];
        assert_eq!(a.read(&mut buf).await, Err(DeviceError::WouldBlock));
    }

    #[tokio::test]
    async fn test_open_wakes_writer_blocked_on_full_ring() {
        let dev = Arc::new(ChannelDevice::new(0, 4).unwrap());
        let ids = IdGen::new();
        let writer = open(&dev, &ids, false).await;
        assert_eq!(writer.write(b"abc").await.unwrap(), 3);

        let task = tokio::spawn(async move { writer.write(b"d").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        let _other = open(&dev, &ids, true).await;
        let written = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("writer was not woken by the open")
            .unwrap();
        assert_eq!(written, Ok(1));
    }

    #[tokio::test]
    async fn test_interrupt_while_waiting_for_ring_lock() {
        let dev = Arc::new(ChannelDevice::new(0, 16).unwrap());
        let ids = IdGen::new();
        let holder = open(&dev, &ids, true).await;
        let source = InterruptSource::new();
        let s = dev
            .open(ids.get_next(), AccessMode::ReadWrite, true, source.interrupt())
            .await
            .unwrap();

        let held = holder.member.ring.state.lock().await;
        let task = tokio::spawn(async move { s.write(b"x").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        source.raise();
        let out = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("locked write was not interrupted")
            .unwrap();
        assert_eq!(out, Err(DeviceError::Interrupted));
        assert!(held.is_empty());
    }

    #[tokio::test]
    async fn test_open_interrupted_on_locked_ring_leaves_counts() {
        let dev = Arc::new(ChannelDevice::new(0, 16).unwrap());
        let ids = IdGen::new();
        let holder = open(&dev, &ids, true).await;
        assert_eq!((dev.readers(), dev.writers()), (1, 1));

        let source = InterruptSource::new();
        source.raise();
        let held = holder.member.ring.state.lock().await;
        let out = dev
            .open(ids.get_next(), AccessMode::ReadOnly, true, source.interrupt())
            .await;
        assert!(matches!(out, Err(DeviceError::Interrupted)));
        drop(held);
        assert_eq!((dev.readers(), dev.writers()), (1, 1));
    }

    #[tokio::test]
    async fn test_control_capacity() {
        let dev = Arc::new(ChannelDevice::new(0, 64).unwrap());
        let ids = IdGen::new();
        let s = open(&dev, &ids, true).await;
        assert_eq!(
            s.control(Opcode::TellCapacity, ControlArg::Value(256), Credentials::admin()),
            Ok(0)
        );
        assert_eq!(
            s.control(Opcode::QueryCapacity, ControlArg::None, Credentials::user()),
            Ok(256)
        );
        assert!(matches!(
            s.control(Opcode::QueryQuantum, ControlArg::None, Credentials::user()),
            Err(DeviceError::InvalidArgument(_))
        ));
        s.control(Opcode::Reset, ControlArg::None, Credentials::admin())
            .unwrap();
        assert_eq!(dev.capacity(), 64);
    }

    #[test]
    fn test_capacity_validation() {
        assert!(ChannelDevice::new(0, 1).is_err());
        let dev = ChannelDevice::new(0, 2).unwrap();
        assert!(dev.set_capacity(0).is_err());
        dev.set_capacity(64).unwrap();
        dev.reset_capacity();
        assert_eq!(dev.capacity(), 2);
    }
}
