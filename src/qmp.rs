//! QMP management channel.
//!
//! tapvm drives exactly one exchange over qemu's QMP socket: asking the
//! guest to power down cleanly. QMP is line-delimited JSON over a unix
//! socket; the server greets on connect, must be moved out of
//! capabilities negotiation, and answers every command with a `return`
//! object (asynchronous events may arrive interleaved).

use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

/// Per-message timeout. QMP answers locally, so anything slower means a
/// wedged monitor rather than a slow guest.
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Ask the guest to power down cleanly (ACPI power button).
///
/// Success means the request was delivered, not that the guest has shut
/// down; the caller keeps waiting for the child to exit.
pub async fn request_powerdown(socket: &Path) -> Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| Error::management(format!("connect {}: {}", socket.display(), e)))?;

    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let greeting = read_message(&mut reader).await?;
    if greeting.get("QMP").is_none() {
        return Err(Error::management(format!(
            "unexpected QMP greeting from {}",
            socket.display()
        )));
    }

    execute(&mut write, &mut reader, "qmp_capabilities").await?;
    execute(&mut write, &mut reader, "system_powerdown").await?;

    Ok(())
}

/// Send one command and wait for its `return`.
async fn execute(
    write: &mut OwnedWriteHalf,
    reader: &mut BufReader<OwnedReadHalf>,
    command: &str,
) -> Result<()> {
    let mut payload = json!({ "execute": command }).to_string();
    payload.push('\n');

    tokio::time::timeout(IO_TIMEOUT, write.write_all(payload.as_bytes()))
        .await
        .map_err(|_| Error::management(format!("timed out sending {}", command)))?
        .map_err(|e| Error::management(format!("send {}: {}", command, e)))?;

    wait_for_ok(reader).await
}

/// Read one JSON message off the socket.
async fn read_message(reader: &mut BufReader<OwnedReadHalf>) -> Result<Value> {
    let mut line = String::new();
    let n = tokio::time::timeout(IO_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| Error::management("timed out waiting for QMP reply"))?
        .map_err(|e| Error::management(format!("read: {}", e)))?;

    if n == 0 {
        return Err(Error::management("QMP connection closed unexpectedly"));
    }

    serde_json::from_str(&line).map_err(|e| Error::management(format!("malformed QMP message: {}", e)))
}

/// Consume messages until a `return` or `error` arrives.
async fn wait_for_ok(reader: &mut BufReader<OwnedReadHalf>) -> Result<()> {
    loop {
        let message = read_message(reader).await?;
        if message.get("return").is_some() {
            return Ok(());
        }
        if let Some(err) = message.get("error") {
            return Err(Error::management(format!("QMP error response: {}", err)));
        }
        // Anything else is an asynchronous event; skip it.
    }
}
