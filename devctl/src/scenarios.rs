//! Scripted runs against a device table

use std::sync::Arc;
use std::time::Duration;

use memdev::{AccessMode, ControlArg, DevFs, DeviceError, Opcode, Readiness, Whence};
use tokio::sync::oneshot;
use tracing::info;

pub type ScenarioResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub const NAMES: [&str; 5] = ["store", "ioctl", "pipe", "poll", "fasync"];

pub async fn run(name: &str, fs: &Arc<DevFs>) -> ScenarioResult {
    match name {
        "store" => store_roundtrip(fs).await,
        "ioctl" => ioctl(fs).await,
        "pipe" => pipe(fs).await,
        "poll" => poll(fs).await,
        "fasync" => fasync(fs).await,
        other => Err(format!("unknown scenario '{other}'").into()),
    }
}

fn check(what: &str, ok: bool) -> ScenarioResult {
    if ok {
        Ok(())
    } else {
        Err(format!("check failed: {what}").into())
    }
}

async fn store_roundtrip(fs: &DevFs) -> ScenarioResult {
    let fd = fs.open_mode("/dev/store0", AccessMode::ReadWrite).await?;
    let message = b"Hello, world!";
    fs.write_all(fd, message).await?;
    fs.lseek(fd, 0, Whence::Absolute).await?;

    let mut buf = [0u8; 64];
    let n = fs.read(fd, &mut buf).await?;
    info!(bytes = n, data = %String::from_utf8_lossy(&buf[..n]), "store read back");
    check("store returns what was written", &buf[..n] == message)?;
    fs.close(fd)?;
    Ok(())
}

async fn ioctl(fs: &DevFs) -> ScenarioResult {
    let fd = fs.open_mode("/dev/store1", AccessMode::ReadWrite).await?;
    fs.ioctl(fd, Opcode::TellQuantum.nr(), ControlArg::Value(2048))
        .await?;

    let mut payload = 1024i32.to_ne_bytes();
    fs.ioctl(fd, Opcode::ExchangeQuantum.nr(), ControlArg::InOut(&mut payload))
        .await?;
    let old = i32::from_ne_bytes(payload);
    let now = fs
        .ioctl(fd, Opcode::QueryQuantum.nr(), ControlArg::None)
        .await?;
    info!(old, now, "exchanged quantum");
    check("exchange returns the previous quantum", old == 2048)?;
    check("exchange installs the new quantum", now == 1024)?;

    fs.ioctl(fd, Opcode::Reset.nr(), ControlArg::None).await?;
    fs.close(fd)?;
    Ok(())
}

async fn pipe(fs: &Arc<DevFs>) -> ScenarioResult {
    let fd = fs.open_mode("/dev/chan0", AccessMode::ReadWrite).await?;
    fs.ioctl(fd, Opcode::TellCapacity.nr(), ControlArg::Value(256))
        .await?;
    fs.close(fd)?;
    let fd = fs.open_mode("/dev/chan0", AccessMode::ReadWrite).await?;

    let (ready_tx, ready_rx) = oneshot::channel();
    let reader_fs = Arc::clone(fs);
    let reader = tokio::spawn(async move {
        let _ = ready_tx.send(());
        let mut buf = [0u8; 1024];
        let n = reader_fs.read(fd, &mut buf).await?;
        Ok::<_, DeviceError>(buf[..n].to_vec())
    });
    ready_rx.await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    fs.write(fd, b"Hello, pipe!").await?;
    let got = reader.await??;
    info!(data = %String::from_utf8_lossy(&got), "reader woke up");
    check("blocked reader gets the message", got == b"Hello, pipe!")?;

    let full = [b'A'; 299];
    let first = fs.write(fd, &full).await?;
    let second = fs.write(fd, &full).await?;
    info!(first, second, "filled the channel");
    check("writes stop at the wrap and one short of the reader", (first, second) == (244, 11))?;

    let writer_fs = Arc::clone(fs);
    let writer =
        tokio::spawn(async move { writer_fs.write(fd, b"This should block until read.").await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    check("third write blocks", !writer.is_finished())?;

    let mut buf = [0u8; 1024];
    let drained = fs.read(fd, &mut buf).await?;
    let unblocked = writer.await??;
    info!(drained, unblocked, "drained the channel");
    fs.close(fd)?;
    Ok(())
}

async fn poll(fs: &Arc<DevFs>) -> ScenarioResult {
    let rd = fs.open_mode("/dev/chan1", AccessMode::ReadOnly).await?;
    let wr = fs.open_mode("/dev/chan1", AccessMode::WriteOnly).await?;

    let poll_fs = Arc::clone(fs);
    let waiter = tokio::spawn(async move { poll_fs.poll_wait(rd, Readiness::READABLE).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    fs.write(wr, b"Test data").await?;

    let ready = waiter.await??;
    info!(readiness = ?ready, "poll woke up");
    check("channel is readable", ready.is_readable())?;
    fs.close(rd)?;
    fs.close(wr)?;
    Ok(())
}

async fn fasync(fs: &Arc<DevFs>) -> ScenarioResult {
    let listener = fs.open_mode("/dev/chan2", AccessMode::ReadWrite).await?;
    fs.fasync(listener, true)?;

    let writer = fs.open_mode("/dev/chan2", AccessMode::WriteOnly).await?;
    fs.write(writer, b"Hello, SCULL!").await?;

    let signal = tokio::time::timeout(Duration::from_secs(1), fs.next_signal(listener)).await??;
    info!(?signal, "notification received");
    fs.fasync(listener, false)?;
    fs.close(listener)?;
    fs.close(writer)?;
    Ok(())
}
