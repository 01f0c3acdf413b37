//! Bulk file transfer over an established game socket.
//!
//! Snapshots are too large for the framed packet layer, so they travel as a
//! raw byte stream: one ordinary announce command carrying the length,
//! followed by the bytes themselves in fixed-size chunks. Both ends switch
//! the socket to blocking mode with a per-chunk timeout for the duration;
//! callers running a nonblocking event loop re-arm the socket afterwards.

use crate::command::{Command, GameTransferCmd, Message};
use log::{debug, info};
use std::error::Error;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

pub const CHUNK_SIZE: usize = 4096;
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(5);

/// Streams the file at `path` to the peer: announce command first, then the
/// raw bytes. `progress` is invoked after every chunk with (sent, total).
pub fn send_file<F>(
    stream: &mut TcpStream,
    path: &Path,
    sender: u32,
    mut progress: F,
) -> Result<(), Box<dyn Error>>
where
    F: FnMut(u64, u64),
{
    let total = fs::metadata(path)?.len();
    if total > u32::MAX as u64 {
        return Err(format!("{} is too large to transfer", path.display()).into());
    }
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(CHUNK_TIMEOUT))?;

    let announce = Message::new(
        sender,
        Command::GameTransfer(GameTransferCmd {
            length: total as u32,
        }),
    );
    let mut pkt = announce.encode();
    let frame = pkt
        .to_bytes()
        .ok_or("could not frame the transfer announcement")?;
    stream.write_all(frame)?;

    let mut file = File::open(path)?;
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        stream.write_all(&chunk[..n])?;
        sent += n as u64;
        progress(sent, total);
    }
    if sent != total {
        return Err("file shrank while being transferred".into());
    }
    info!("sent {} ({} bytes)", path.display(), total);
    Ok(())
}

/// Receives `length` raw bytes into the file at `path`, replacing any
/// pre-existing file. The announce command has already been consumed by the
/// caller. `progress` is invoked after every chunk with (received, total).
pub fn receive_file<F>(
    stream: &mut TcpStream,
    path: &Path,
    length: u32,
    mut progress: F,
) -> Result<(), Box<dyn Error>>
where
    F: FnMut(u64, u64),
{
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CHUNK_TIMEOUT))?;

    // Truncates any stale file so a failed transfer can never be mistaken
    // for a complete one.
    let mut file = File::create(path)?;
    let total = length as u64;
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut received: u64 = 0;
    while received < total {
        let want = ((total - received) as usize).min(CHUNK_SIZE);
        let n = stream.read(&mut chunk[..want])?;
        if n == 0 {
            return Err("not enough bytes transferred before the peer closed".into());
        }
        file.write_all(&chunk[..n])?;
        received += n as u64;
        progress(received, total);
    }
    file.flush()?;
    debug!("received {} ({} bytes)", path.display(), total);
    Ok(())
}
