//! Supervisor ↔ session control channel.
//!
//! In-process sessions receive [`ControlEnvelope`]s over an mpsc channel.
//! Sessions running as child processes get the same requests as
//! newline-delimited JSON on stdin and answer on stdout, one reply per
//! request, preceded by a single [`ControlReply::Ready`] or
//! [`ControlReply::BindFailed`] line once the listener is (or is not) bound.
//! The management server reuses the same framing over TCP.

use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::state_machine::PowerState;

/// Longest accepted frame, newline included.
pub const MAX_FRAME: u64 = 1_048_576;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Report the power state, polling the VM when not mid-transition.
    Status,
    /// Finish any in-flight operation, then exit.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ControlReply {
    Ready {
        addr: SocketAddr,
    },
    BindFailed {
        reason: String,
    },
    Status {
        power: Option<PowerState>,
        error: Option<String>,
    },
    ShuttingDown,
}

/// A request plus where to send its reply.
pub type ControlEnvelope = (ControlRequest, oneshot::Sender<ControlReply>);

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame I/O: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame exceeds {MAX_FRAME} bytes")]
    TooLong,
}

/// Write `value` as one JSON line and flush.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON line. `Ok(None)` on a clean end of stream.
///
/// Not cancel safe; callers that select over it run it in its own task.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_FRAME)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') && read as u64 >= MAX_FRAME {
        return Err(FrameError::TooLong);
    }
    Ok(Some(serde_json::from_slice(trim_newline(&line))?))
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn request_wire_format() {
        let json = serde_json::to_string(&ControlRequest::Status).unwrap();
        assert_eq!(json, r#"{"op":"status"}"#);
    }

    #[test]
    fn reply_wire_format() {
        let reply = ControlReply::Status {
            power: Some(PowerState::TransitioningToOn),
            error: None,
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(
            json,
            r#"{"reply":"status","power":"transitioning_to_on","error":null}"#
        );
    }

    #[tokio::test]
    async fn frames_round_trip_over_a_pipe() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = BufReader::new(server);

        write_frame(&mut client, &ControlRequest::Shutdown)
            .await
            .unwrap();
        write_frame(&mut client, &ControlRequest::Status).await.unwrap();
        drop(client);

        let first: Option<ControlRequest> = read_frame(&mut reader).await.unwrap();
        let second: Option<ControlRequest> = read_frame(&mut reader).await.unwrap();
        assert_eq!(first, Some(ControlRequest::Shutdown));
        assert_eq!(second, Some(ControlRequest::Status));
    }

    #[tokio::test]
    async fn garbage_line_is_json_error() {
        let mut reader = BufReader::new(&b"not json\n"[..]);
        let result: Result<Option<ControlRequest>, _> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(FrameError::Json(_))));
    }

    #[tokio::test]
    async fn end_of_stream_is_none() {
        let mut reader = BufReader::new(&b""[..]);
        let result: Option<ControlRequest> = read_frame(&mut reader).await.unwrap();
        assert!(result.is_none());
    }
}
