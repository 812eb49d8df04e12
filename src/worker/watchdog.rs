//! Private per-worker command socket.
//!
//! Every worker serves a Unix socket inside its socket directory. One
//! connection carries one request and one response, each framed as a 4-byte
//! big-endian length followed by a JSON payload.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::WatchdogError;

/// File name of the socket inside the worker's socket directory.
pub const SOCKET_FILE: &str = "watchdog.sock";
/// Where the socket directory is mounted inside the container.
pub const CONTAINER_SOCKET_DIR: &str = "/run/aule";
/// Environment variable telling the worker where to listen.
pub const SOCKET_ENV: &str = "AULE_WATCHDOG_SOCKET";

/// Largest accepted frame payload.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// In-container socket path handed to the worker.
pub fn container_socket_path() -> String {
    format!("{CONTAINER_SOCKET_DIR}/{SOCKET_FILE}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchdogRequest {
    Health,
    Execute { prompt: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl WatchdogResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: None,
            output: None,
        }
    }

    pub fn with_output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::ok()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
            output: None,
        }
    }
}

/// Read one frame. `Ok(None)` on a clean EOF before the length prefix.
pub async fn read_frame<S>(stream: &mut S) -> Result<Option<Vec<u8>>, WatchdogError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0_u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let size = u32::from_be_bytes(len_buf) as usize;
    if size > MAX_FRAME_BYTES {
        return Err(WatchdogError::FrameTooLarge {
            size,
            max: MAX_FRAME_BYTES,
        });
    }
    let mut payload = vec![0_u8; size];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<(), WatchdogError>
where
    S: AsyncWrite + Unpin,
{
    let too_large = || WatchdogError::FrameTooLarge {
        size: payload.len(),
        max: MAX_FRAME_BYTES,
    };
    if payload.len() > MAX_FRAME_BYTES {
        return Err(too_large());
    }
    let len = u32::try_from(payload.len()).map_err(|_| too_large())?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn write_json<S, T>(stream: &mut S, value: &T) -> Result<(), WatchdogError>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload =
        serde_json::to_vec(value).map_err(|e| WatchdogError::Protocol(e.to_string()))?;
    write_frame(stream, &payload).await
}

async fn read_json<S, T>(stream: &mut S) -> Result<T, WatchdogError>
where
    S: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let payload = read_frame(stream)
        .await?
        .ok_or_else(|| WatchdogError::Protocol("connection closed before a frame".to_string()))?;
    serde_json::from_slice(&payload).map_err(|e| WatchdogError::Protocol(e.to_string()))
}

/// Send one request and wait for its response, bounded by `timeout`.
pub async fn call(
    socket: &Path,
    request: &WatchdogRequest,
    timeout: Duration,
) -> Result<WatchdogResponse, WatchdogError> {
    let exchange = async {
        let mut stream = UnixStream::connect(socket).await?;
        write_json(&mut stream, request).await?;
        read_json::<_, WatchdogResponse>(&mut stream).await
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| WatchdogError::Timeout(timeout))?
}

/// Ask the worker whether it is ready.
pub async fn health(socket: &Path, timeout: Duration) -> Result<WatchdogResponse, WatchdogError> {
    call(socket, &WatchdogRequest::Health, timeout).await
}

/// Hand the worker its task and wait for the result.
pub async fn execute(
    socket: &Path,
    prompt: &str,
    timeout: Duration,
) -> Result<WatchdogResponse, WatchdogError> {
    let request = WatchdogRequest::Execute {
        prompt: prompt.to_string(),
    };
    call(socket, &request, timeout).await
}

/// Serve one connection from the worker side: read a request, answer it.
/// Used by worker images and by test doubles.
pub async fn serve_connection<S, F, Fut>(stream: &mut S, handler: F) -> Result<(), WatchdogError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(WatchdogRequest) -> Fut,
    Fut: std::future::Future<Output = WatchdogResponse>,
{
    let request: WatchdogRequest = read_json(stream).await?;
    let response = handler(request).await;
    write_json(stream, &response).await
}

#[cfg(test)]
mod tests {
    use tokio::net::UnixListener;

    use super::*;

    #[test]
    fn request_wire_format() {
        let health = serde_json::to_string(&WatchdogRequest::Health).unwrap();
        assert_eq!(health, r#"{"type":"health"}"#);
        let exec = serde_json::to_value(&WatchdogRequest::Execute {
            prompt: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(exec["type"], "execute");
        assert_eq!(exec["prompt"], "hi");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_BYTES as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, WatchdogError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn eof_before_frame_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn client_and_server_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join(SOCKET_FILE);
        let listener = UnixListener::bind(&socket).unwrap();

        tokio::spawn(async move {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                serve_connection(&mut stream, |request| async move {
                    match request {
                        WatchdogRequest::Health => WatchdogResponse::ok(),
                        WatchdogRequest::Execute { prompt } => {
                            WatchdogResponse::with_output(prompt.to_uppercase())
                        }
                    }
                })
                .await
                .unwrap();
            }
        });

        let timeout = Duration::from_secs(2);
        assert!(health(&socket, timeout).await.unwrap().ok);
        let response = execute(&socket, "done", timeout).await.unwrap();
        assert_eq!(response.output.as_deref(), Some("DONE"));
    }

    #[tokio::test]
    async fn missing_socket_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = health(&dir.path().join(SOCKET_FILE), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchdogError::Io(_)));
    }
}
