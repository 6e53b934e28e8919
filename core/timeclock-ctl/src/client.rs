//! Blocking client for the daemon's control socket.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use timeclock_daemon_protocol::{Method, Request, Response, MAX_REQUEST_BYTES};

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to {path}: {source} (is timeclock-daemon running?)")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Response exceeded maximum size")]
    TooLarge,

    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

pub struct DaemonClient {
    socket: PathBuf,
}

impl DaemonClient {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Sends one request and returns the `data` payload of a successful response.
    pub fn call(&self, method: Method, params: Option<Value>) -> Result<Value, ClientError> {
        let response = self.send(&Request::new(method, params))?;
        if response.ok {
            return Ok(response.data.unwrap_or(Value::Null));
        }
        let (code, message) = response
            .error
            .map(|err| (err.code, err.message))
            .unwrap_or_else(|| ("unknown".to_string(), "unknown daemon error".to_string()));
        Err(ClientError::Daemon { code, message })
    }

    fn send(&self, request: &Request) -> Result<Response, ClientError> {
        let mut stream = UnixStream::connect(&self.socket).map_err(|source| ClientError::Connect {
            path: self.socket.clone(),
            source,
        })?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        stream.write_all(&payload)?;
        stream.flush()?;

        read_response(&mut stream)
    }
}

fn read_response<R: Read>(stream: &mut R) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > MAX_REQUEST_BYTES {
            return Err(ClientError::TooLarge);
        }
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let line = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    Ok(serde_json::from_slice(line)?)
}
