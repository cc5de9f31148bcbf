//! Channel CLI Demo
//!
//! Lines typed on stdin go into `chan0` through one writer session and are
//! taken out by three competing reader sessions, four bytes at a time.
//! An empty line stops the writer; the readers are interrupted once the
//! channel is drained.

use std::time::Duration;

use memdev::{
    AccessMode, ChannelSession, DeviceConfig, DeviceError, DeviceId, DeviceTable,
    InterruptSource, OpenOptions, Session,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let table = DeviceTable::new(DeviceConfig {
        channel_capacity: 16,
        ..DeviceConfig::default()
    })?;
    let stop = InterruptSource::new();

    let writer = table
        .open(DeviceId::Channel(0), &OpenOptions::new(AccessMode::WriteOnly))
        .await?;
    let Session::Channel(writer) = writer else {
        return Err("chan0 is not a channel".into());
    };

    let mut readers = Vec::new();
    for name in ["r1", "r2", "r3"] {
        let options = OpenOptions::new(AccessMode::ReadOnly).interrupt(stop.interrupt());
        let Session::Channel(reader) = table.open(DeviceId::Channel(0), &options).await? else {
            return Err("chan0 is not a channel".into());
        };
        readers.push(tokio::spawn(async move {
            read_all(name, &reader).await;
        }));
    }

    println!("Enter text (empty line to quit):");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        let mut data = trimmed.as_bytes();
        while !data.is_empty() {
            let n = writer.write(data).await?;
            data = &data[n..];
        }
    }
    println!("Writer done");

    while writer.buffered().await? > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stop.raise();

    for reader in readers {
        reader.await?;
    }
    println!("All tasks completed");
    Ok(())
}

async fn read_all(name: &str, reader: &ChannelSession) {
    let mut buf = [0u8; 4];

    loop {
        match reader.read(&mut buf).await {
            Ok(n) => {
                let data = String::from_utf8_lossy(&buf[..n]);
                println!("({name}): {data}");
            }
            Err(DeviceError::Interrupted) => {
                println!("({name}) stopped");
                break;
            }
            Err(e) => {
                eprintln!("({name}) Error: {e}");
                break;
            }
        }
    }
}
