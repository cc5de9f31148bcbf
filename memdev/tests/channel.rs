use std::sync::Arc;
use std::time::Duration;

use memdev::{
    AccessMode, ControlArg, Credentials, DeviceConfig, DeviceError, DeviceId, DeviceTable,
    InterruptSource, Opcode, OpenOptions, Readiness, Session, Signal,
};
use tokio::sync::oneshot;
use tokio::time::timeout;

const GUARD: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(50);

fn table(capacity: usize) -> DeviceTable {
    DeviceTable::new(DeviceConfig {
        channel_capacity: capacity,
        ..DeviceConfig::default()
    })
    .unwrap()
}

async fn open(table: &DeviceTable, options: &OpenOptions) -> Arc<Session> {
    Arc::new(table.open(DeviceId::Channel(0), options).await.unwrap())
}

fn rw() -> OpenOptions {
    OpenOptions::new(AccessMode::ReadWrite)
}

// --------------------------------------------------------------------
// Space accounting
//

#[tokio::test]
async fn test_capacity_minus_one_then_would_block() {
    let capacity = 64;
    let table = table(capacity);
    let s = open(&table, &rw().nonblocking(true)).await;

    let mut filled = 0;
    while filled < capacity - 1 {
        filled += s.write(&vec![b'x'; capacity - 1 - filled]).await.unwrap();
    }
    assert_eq!(s.write(b"y").await, Err(DeviceError::WouldBlock));

    let mut one = [0u8; 1];
    assert_eq!(s.read(&mut one).await.unwrap(), 1);
    assert_eq!(s.write(b"y").await.unwrap(), 1);
    assert_eq!(s.write(b"z").await, Err(DeviceError::WouldBlock));
}

#[tokio::test]
async fn test_capacity_256_scenario() {
    let table = table(4096);
    let setup = open(&table, &rw()).await;
    setup
        .control(Opcode::TellCapacity, ControlArg::Value(256), Credentials::admin())
        .await
        .unwrap();
    assert_eq!(
        setup
            .control(Opcode::QueryCapacity, ControlArg::None, Credentials::user())
            .await,
        Ok(256)
    );
    drop(setup);

    let s = open(&table, &rw()).await;

    // A blocked reader is released by a writer
    let reader = Arc::clone(&s);
    let first = tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let n = reader.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    });
    tokio::time::sleep(SETTLE).await;
    assert_eq!(s.write(b"Hello, pipe!").await.unwrap(), 12);
    let got = timeout(GUARD, first).await.unwrap().unwrap();
    assert_eq!(got, b"Hello, pipe!");

    // Two 299-byte writes buffer 255 bytes: 244 up to the end, 11 after wrapping
    let full = vec![b'A'; 299];
    assert_eq!(s.write(&full).await.unwrap(), 244);
    assert_eq!(s.write(&full).await.unwrap(), 11);

    // The ring is full: the next write blocks until a reader drains it
    let (started_tx, started_rx) = oneshot::channel();
    let writer = Arc::clone(&s);
    let blocked = tokio::spawn(async move {
        started_tx.send(()).unwrap();
        writer.write(b"This should block until read.").await
    });
    started_rx.await.unwrap();
    tokio::time::sleep(SETTLE).await;
    assert!(!blocked.is_finished());

    let mut buf = [0u8; 1024];
    let n = s.read(&mut buf).await.unwrap();
    assert_eq!(n, 244);
    let written = timeout(GUARD, blocked).await.unwrap().unwrap().unwrap();
    assert!(written > 0 && written <= 30);
}

#[tokio::test]
async fn test_capacity_change_waits_for_next_buffer() {
    let table = table(32);
    let s = open(&table, &rw().nonblocking(true)).await;
    s.control(Opcode::TellCapacity, ControlArg::Value(8), Credentials::admin())
        .await
        .unwrap();
    // Still the old buffer
    assert_eq!(s.write(&[0u8; 40]).await.unwrap(), 31);
    drop(s);

    let s = open(&table, &rw().nonblocking(true)).await;
    assert_eq!(s.write(&[0u8; 40]).await.unwrap(), 7);
}

#[tokio::test]
async fn test_second_open_empties_the_channel() {
    let table = table(64);
    let a = open(&table, &rw().nonblocking(true)).await;
    a.write(b"abc").await.unwrap();
    assert!(a.poll().await.unwrap().is_readable());

    let b = open(&table, &rw().nonblocking(true)).await;
    let Session::Channel(chan) = &*b else {
        panic!("chan0 is not a channel");
    };
    assert_eq!(chan.buffered().await.unwrap(), 0);
    assert_eq!(a.poll().await.unwrap(), Readiness::WRITABLE);

    let mut buf = [0u8; 4];
    assert_eq!(a.read(&mut buf).await, Err(DeviceError::WouldBlock));
    b.write(b"new").await.unwrap();
    assert_eq!(a.read(&mut buf).await.unwrap(), 3);
    assert_eq!(&buf[..3], b"new");
}

#[tokio::test]
async fn test_buffer_survives_while_any_session_is_open() {
    let table = table(16);
    let writer = open(&table, &OpenOptions::new(AccessMode::WriteOnly)).await;
    let reader = open(&table, &OpenOptions::new(AccessMode::ReadOnly).nonblocking(true)).await;
    writer.write(b"kept").await.unwrap();
    drop(writer);

    let mut buf = [0u8; 8];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
    assert_eq!(&buf[..4], b"kept");
    let chan = table.channel(0).unwrap();
    assert_eq!((chan.readers(), chan.writers()), (1, 0));
    drop(reader);
    assert!(!chan.is_allocated());
}

// --------------------------------------------------------------------
// Blocking and interrupts
//

#[tokio::test]
async fn test_blocking_read_returns_written_bytes_in_order() {
    let table = table(128);
    let s = open(&table, &rw()).await;

    let reader = Arc::clone(&s);
    let task = tokio::spawn(async move {
        let mut got = Vec::new();
        let mut buf = [0u8; 5];
        while got.len() < 26 {
            let n = reader.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        got
    });

    for chunk in b"abcdefghijklmnopqrstuvwxyz".chunks(7) {
        tokio::time::sleep(Duration::from_millis(5)).await;
        s.write(chunk).await.unwrap();
    }
    let got = timeout(GUARD, task).await.unwrap().unwrap();
    assert_eq!(got, b"abcdefghijklmnopqrstuvwxyz");
}

#[tokio::test]
async fn test_interrupt_aborts_blocked_read() {
    let table = table(16);
    let source = InterruptSource::new();
    let s = open(&table, &rw().interrupt(source.interrupt())).await;

    let reader = Arc::clone(&s);
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 4];
        reader.read(&mut buf).await
    });
    tokio::time::sleep(SETTLE).await;
    source.raise();

    let out = timeout(GUARD, task).await.unwrap().unwrap();
    assert_eq!(out, Err(DeviceError::Interrupted));

    // Nothing was consumed; once cleared the session works again
    source.clear();
    s.write(b"ok").await.unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(s.read(&mut buf).await.unwrap(), 2);
}

#[tokio::test]
async fn test_interrupt_aborts_blocked_write() {
    let table = table(4);
    let source = InterruptSource::new();
    let s = open(&table, &rw().interrupt(source.interrupt())).await;
    assert_eq!(s.write(b"abc").await.unwrap(), 3);

    let writer = Arc::clone(&s);
    let task = tokio::spawn(async move { writer.write(b"d").await });
    tokio::time::sleep(SETTLE).await;
    source.raise();

    let out = timeout(GUARD, task).await.unwrap().unwrap();
    assert_eq!(out, Err(DeviceError::Interrupted));
}

#[tokio::test]
async fn test_set_nonblocking_after_open() {
    let table = table(16);
    let s = open(&table, &rw()).await;
    s.set_nonblocking(true);
    let mut buf = [0u8; 4];
    assert_eq!(s.read(&mut buf).await, Err(DeviceError::WouldBlock));
}

// --------------------------------------------------------------------
// Readiness
//

#[tokio::test]
async fn test_poll_agrees_with_nonblocking_io() {
    let table = table(4);
    let s = open(&table, &rw().nonblocking(true)).await;
    let mut buf = [0u8; 4];

    let ready = s.poll().await.unwrap();
    assert!(!ready.is_readable() && ready.is_writable());
    assert_eq!(s.read(&mut buf).await, Err(DeviceError::WouldBlock));

    s.write(b"abc").await.unwrap();
    let ready = s.poll().await.unwrap();
    assert!(ready.is_readable() && !ready.is_writable());
    assert_eq!(s.write(b"d").await, Err(DeviceError::WouldBlock));

    assert_eq!(s.read(&mut buf).await.unwrap(), 3);
    assert_eq!(s.poll().await.unwrap(), Readiness::WRITABLE);
}

#[tokio::test]
async fn test_wait_ready_wakes_on_write() {
    let table = table(64);
    let s = open(&table, &rw()).await;

    let poller = Arc::clone(&s);
    let task = tokio::spawn(async move { poller.wait_ready(Readiness::READABLE).await });
    tokio::time::sleep(SETTLE).await;
    assert!(!task.is_finished());

    s.write(b"Test data").await.unwrap();
    let ready = timeout(GUARD, task).await.unwrap().unwrap().unwrap();
    assert!(ready.is_readable());
}

#[tokio::test]
async fn test_wait_ready_interrupted() {
    let table = table(64);
    let source = InterruptSource::new();
    let s = open(&table, &rw().interrupt(source.interrupt())).await;

    let poller = Arc::clone(&s);
    let task = tokio::spawn(async move { poller.wait_ready(Readiness::READABLE).await });
    tokio::time::sleep(SETTLE).await;
    source.raise();
    let out = timeout(GUARD, task).await.unwrap().unwrap();
    assert_eq!(out, Err(DeviceError::Interrupted));
}

// --------------------------------------------------------------------
// Asynchronous notification
//

#[tokio::test]
async fn test_async_notification_on_write() {
    let table = table(64);
    let listener = open(&table, &rw()).await;
    listener.set_async(true).unwrap();
    assert_eq!(table.channel(0).unwrap().subscribers(), 1);

    let writer = open(&table, &OpenOptions::new(AccessMode::WriteOnly)).await;
    let task = tokio::spawn(async move {
        tokio::time::sleep(SETTLE).await;
        writer.write(b"Hello, SCULL!").await.unwrap();
    });

    let signal = timeout(GUARD, listener.next_signal()).await.unwrap().unwrap();
    assert_eq!(signal, Signal::Readable { channel: 0 });
    task.await.unwrap();
}

#[tokio::test]
async fn test_async_notification_disabled_and_closed() {
    let table = table(64);
    let listener = open(&table, &rw()).await;
    listener.set_async(true).unwrap();
    listener.set_async(false).unwrap();
    listener.write(b"x").await.unwrap();
    assert_eq!(listener.try_next_signal(), None);

    listener.set_async(true).unwrap();
    drop(listener);
    assert_eq!(table.channel(0).unwrap().subscribers(), 0);
}
