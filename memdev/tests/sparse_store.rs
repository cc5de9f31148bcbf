use memdev::sparse::{QuantumSet, SparseStore, Whence};
use std::time::Duration;

use memdev::{
    AccessMode, DeviceConfig, DeviceError, DeviceId, DeviceTable, Interrupt, InterruptSource,
    OpenOptions, Session, SlotAllocator,
};

async fn open_store(table: &DeviceTable, index: usize, mode: AccessMode) -> Session {
    table
        .open(DeviceId::Store(index), &OpenOptions::new(mode))
        .await
        .unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// --------------------------------------------------------------------
// Store through sessions
//

#[tokio::test]
async fn test_write_5000_bytes_in_a_loop_and_read_back() {
    let table = DeviceTable::new(DeviceConfig::default()).unwrap();
    let s = open_store(&table, 0, AccessMode::ReadWrite).await;
    let data = pattern(5000);

    let mut written = 0;
    while written < data.len() {
        let n = s.write(&data[written..]).await.unwrap();
        assert!(n > 0);
        written += n;
    }
    let Session::Store(store) = &s else {
        panic!("store0 is not a store");
    };
    assert_eq!(store.size().await.unwrap(), 5000);

    s.seek(0, Whence::Absolute).await.unwrap();
    let mut back = Vec::new();
    let mut buf = [0u8; 1500];
    loop {
        let n = s.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        back.extend_from_slice(&buf[..n]);
    }
    assert_eq!(back, data);

    let mut one = [0u8; 1];
    assert_eq!(store.read_at(5000, &mut one).await.unwrap(), 0);
}

#[tokio::test]
async fn test_first_write_stops_at_quantum_boundary() {
    let table = DeviceTable::new(DeviceConfig::default()).unwrap();
    let s = open_store(&table, 0, AccessMode::ReadWrite).await;
    assert_eq!(s.write(&pattern(5000)).await.unwrap(), 4096);
    assert_eq!(s.write(&pattern(5000)).await.unwrap(), 4096);
}

#[tokio::test]
async fn test_sessions_keep_their_own_positions() {
    let table = DeviceTable::new(DeviceConfig::default()).unwrap();
    let a = open_store(&table, 1, AccessMode::ReadWrite).await;
    let b = open_store(&table, 1, AccessMode::ReadOnly).await;

    a.write(b"shared data").await.unwrap();
    let mut buf = [0u8; 6];
    assert_eq!(b.read(&mut buf).await.unwrap(), 6);
    assert_eq!(&buf, b"shared");
    assert_eq!(b.seek(0, Whence::Relative).await.unwrap(), 6);
    assert_eq!(a.seek(0, Whence::Relative).await.unwrap(), 11);
}

#[tokio::test]
async fn test_write_only_open_empties_the_store() {
    let table = DeviceTable::new(DeviceConfig::default()).unwrap();
    let rw = open_store(&table, 2, AccessMode::ReadWrite).await;
    rw.write(b"old contents").await.unwrap();

    let _wo = open_store(&table, 2, AccessMode::WriteOnly).await;
    rw.seek(0, Whence::Absolute).await.unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(rw.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_negative_seek_is_rejected() {
    let table = DeviceTable::new(DeviceConfig::default()).unwrap();
    let s = open_store(&table, 0, AccessMode::ReadWrite).await;
    s.write(b"abc").await.unwrap();
    assert!(matches!(
        s.seek(-4, Whence::FromEnd).await,
        Err(DeviceError::InvalidArgument(_))
    ));
    // Position unchanged by the failed seek
    assert_eq!(s.seek(0, Whence::Relative).await.unwrap(), 3);
}

#[tokio::test]
async fn test_stores_are_independent() {
    let table = DeviceTable::new(DeviceConfig::default()).unwrap();
    let a = open_store(&table, 0, AccessMode::ReadWrite).await;
    let b = open_store(&table, 3, AccessMode::ReadWrite).await;
    a.write(b"only in store0").await.unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(b.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_interrupt_while_waiting_for_store_lock() {
    let table = DeviceTable::new(DeviceConfig::default()).unwrap();
    let source = InterruptSource::new();
    let options = OpenOptions::new(AccessMode::ReadWrite).interrupt(source.interrupt());
    let s = table.open(DeviceId::Store(0), &options).await.unwrap();

    let held = table.store(0).unwrap().lock(&Interrupt::never()).await.unwrap();
    let task = tokio::spawn(async move { s.write(b"x").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    source.raise();
    let out = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out, Err(DeviceError::Interrupted));

    // Nothing was written
    assert_eq!(held.size(), 0);
}

// --------------------------------------------------------------------
// Out of memory
//

#[tokio::test]
async fn test_oom_keeps_partial_growth_and_reports() {
    let config = DeviceConfig {
        store_count: 1,
        quantum: 16,
        qset: 2,
        ..DeviceConfig::default()
    };
    // One set node and its chunk array, but no room for a quantum
    let node = std::mem::size_of::<QuantumSet>();
    let slots = 2 * std::mem::size_of::<Option<memdev::alloc::Quantum>>();
    let alloc = SlotAllocator::with_limit(node + slots + 8);
    let table = DeviceTable::with_allocator(config, alloc.clone()).unwrap();
    let s = open_store(&table, 0, AccessMode::ReadWrite).await;

    assert_eq!(s.write(b"abc").await, Err(DeviceError::OutOfMemory));
    assert!(alloc.in_use() >= node);

    // Nothing was stored and nothing readable appeared
    let mut buf = [0u8; 4];
    assert_eq!(s.read(&mut buf).await.unwrap(), 0);

    table.shutdown().await;
    assert_eq!(alloc.in_use(), 0);
}

#[test]
fn test_store_trim_then_reuse() {
    let mut store = SparseStore::new(8, 2, SlotAllocator::unbounded()).unwrap();
    for offset in (0..64u64).step_by(8) {
        assert_eq!(store.write(offset, &[0xaa; 8]).unwrap(), 8);
    }
    assert_eq!(store.allocated_sets(), 4);
    assert_eq!(store.allocated_quanta(), 8);

    store.trim();
    assert_eq!(store.size(), 0);
    let mut buf = [0u8; 8];
    assert_eq!(store.read(0, &mut buf), 0);

    store.write(0, b"again").unwrap();
    assert_eq!(store.read(0, &mut buf), 5);
    assert_eq!(&buf[..5], b"again");
}

// --------------------------------------------------------------------
// embedded-io
//

#[tokio::test]
async fn test_store_session_as_embedded_io() {
    use embedded_io_async::{Read, Seek, SeekFrom, Write};

    let table = DeviceTable::new(DeviceConfig::default()).unwrap();
    let Session::Store(mut s) = open_store(&table, 0, AccessMode::ReadWrite).await else {
        panic!("store0 is not a store");
    };

    s.write_all(br#"{"channel_count": 2, "quantum": 64}"#)
        .await
        .unwrap();
    assert_eq!(Seek::seek(&mut s, SeekFrom::Start(0)).await.unwrap(), 0);

    let config = DeviceConfig::from_reader(&mut s).await.unwrap();
    assert_eq!(config.channel_count, 2);
    assert_eq!(config.quantum, 64);

    let mut buf = [0u8; 1];
    assert_eq!(Read::read(&mut s, &mut buf).await.unwrap(), 0);
}
