//! Low-level instrument communication seam.
//!
//! Controllers never touch sockets directly; they speak through
//! [`InstrumentLink`], a thin command/query abstraction over the
//! SCPI-style text protocol the bench instruments use. The real
//! implementation is [`TcpLink`]; [`MemoryLink`] provides a scriptable
//! in-memory link for tests and offline development.
//!
//! The reachability [`probe`] used during the `Verifying` state also
//! lives here.

use crate::error::{AppResult, BenchError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Command/response primitives supplied by the device-driver collaborator.
///
/// All calls are made synchronously from within an operation's execution
/// context; faults are translated into `OperationResult`s by the caller.
#[async_trait]
pub trait InstrumentLink: Send + Sync {
    /// Establishes the connection. Idempotent.
    async fn open(&self) -> AppResult<()>;

    /// Tears the connection down. Idempotent.
    async fn close(&self) -> AppResult<()>;

    /// Sends a command that produces no reply.
    async fn command(&self, cmd: &str) -> AppResult<()>;

    /// Sends a query and returns the single-line reply.
    async fn query(&self, cmd: &str) -> AppResult<String>;
}

/// Lightweight reachability check against a device endpoint, issued
/// before committing to longer-running controller calls.
pub async fn probe(address: &str, timeout: Duration) -> AppResult<()> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => {
            debug!(address, "probe ok");
            Ok(())
        }
        Ok(Err(e)) => Err(BenchError::Driver(format!(
            "probe of {address} failed: {e}"
        ))),
        Err(_) => Err(BenchError::Driver(format!(
            "probe of {address} timed out after {timeout:?}"
        ))),
    }
}

// =============================================================================
// TCP link
// =============================================================================

/// Newline-delimited text link over TCP, as used by SCPI-over-socket
/// instruments.
pub struct TcpLink {
    address: String,
    io_timeout: Duration,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

impl TcpLink {
    pub fn new(address: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            io_timeout,
            stream: Mutex::new(None),
        }
    }

    async fn write_line(stream: &mut BufReader<TcpStream>, cmd: &str) -> std::io::Result<()> {
        stream.get_mut().write_all(cmd.as_bytes()).await?;
        stream.get_mut().write_all(b"\n").await?;
        stream.get_mut().flush().await
    }
}

#[async_trait]
impl InstrumentLink for TcpLink {
    async fn open(&self) -> AppResult<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let stream = tokio::time::timeout(self.io_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                BenchError::Driver(format!("connect to {} timed out", self.address))
            })?
            .map_err(|e| BenchError::Driver(format!("connect to {} failed: {e}", self.address)))?;
        *guard = Some(BufReader::new(stream));
        debug!(address = %self.address, "link opened");
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.get_mut().shutdown().await;
            debug!(address = %self.address, "link closed");
        }
        Ok(())
    }

    async fn command(&self, cmd: &str) -> AppResult<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| BenchError::Driver("link not open".to_string()))?;
        trace!(cmd, "-> device");
        tokio::time::timeout(self.io_timeout, Self::write_line(stream, cmd))
            .await
            .map_err(|_| BenchError::Driver(format!("write of '{cmd}' timed out")))?
            .map_err(|e| BenchError::Driver(format!("write of '{cmd}' failed: {e}")))
    }

    async fn query(&self, cmd: &str) -> AppResult<String> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| BenchError::Driver("link not open".to_string()))?;
        trace!(cmd, "-> device (query)");
        let reply = tokio::time::timeout(self.io_timeout, async {
            Self::write_line(stream, cmd).await?;
            let mut line = String::new();
            stream.read_line(&mut line).await?;
            Ok::<_, std::io::Error>(line)
        })
        .await
        .map_err(|_| BenchError::Driver(format!("query '{cmd}' timed out")))?
        .map_err(|e| BenchError::Driver(format!("query '{cmd}' failed: {e}")))?;
        let reply = reply.trim_end().to_string();
        trace!(reply, "<- device");
        Ok(reply)
    }
}

// =============================================================================
// In-memory link
// =============================================================================

/// Scriptable link that answers queries from canned responses.
///
/// Responses queued with [`MemoryLink::enqueue`] are consumed in order;
/// [`MemoryLink::set_response`] installs a sticky fallback. Unscripted
/// queries answer `"OK"`. Every command sent is recorded for assertions.
#[derive(Default)]
pub struct MemoryLink {
    queued: StdMutex<HashMap<String, VecDeque<String>>>,
    sticky: StdMutex<HashMap<String, String>>,
    failures: StdMutex<HashMap<String, String>>,
    sent: StdMutex<Vec<String>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one response for the next occurrence of `cmd`.
    pub fn enqueue(&self, cmd: &str, response: &str) {
        self.lock(&self.queued)
            .entry(cmd.to_string())
            .or_default()
            .push_back(response.to_string());
    }

    /// Installs a sticky response for `cmd`.
    pub fn set_response(&self, cmd: &str, response: &str) {
        self.lock(&self.sticky)
            .insert(cmd.to_string(), response.to_string());
    }

    /// Makes every future occurrence of `cmd` fail with `message`.
    pub fn fail_on(&self, cmd: &str, message: &str) {
        self.lock(&self.failures)
            .insert(cmd.to_string(), message.to_string());
    }

    /// Commands and queries sent so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.lock(&self.sent).clone()
    }

    fn lock<'a, T>(&self, m: &'a StdMutex<T>) -> std::sync::MutexGuard<'a, T> {
        match m.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn answer(&self, cmd: &str) -> AppResult<String> {
        if let Some(message) = self.lock(&self.failures).get(cmd) {
            return Err(BenchError::Driver(message.clone()));
        }
        if let Some(queue) = self.lock(&self.queued).get_mut(cmd) {
            if let Some(response) = queue.pop_front() {
                return Ok(response);
            }
        }
        if let Some(response) = self.lock(&self.sticky).get(cmd) {
            return Ok(response.clone());
        }
        Ok("OK".to_string())
    }
}

#[async_trait]
impl InstrumentLink for MemoryLink {
    async fn open(&self) -> AppResult<()> {
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        Ok(())
    }

    async fn command(&self, cmd: &str) -> AppResult<()> {
        self.lock(&self.sent).push(cmd.to_string());
        self.answer(cmd).map(|_| ())
    }

    async fn query(&self, cmd: &str) -> AppResult<String> {
        self.lock(&self.sent).push(cmd.to_string());
        self.answer(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_link_scripting() {
        let link = MemoryLink::new();
        link.enqueue("CAL:STAT?", "ITER");
        link.enqueue("CAL:STAT?", "CONV");
        link.set_response("MEAS:TEMP?", "36.5");

        assert_eq!(link.query("CAL:STAT?").await.unwrap(), "ITER");
        assert_eq!(link.query("CAL:STAT?").await.unwrap(), "CONV");
        // Queue exhausted, defaults apply.
        assert_eq!(link.query("CAL:STAT?").await.unwrap(), "OK");
        assert_eq!(link.query("MEAS:TEMP?").await.unwrap(), "36.5");
        assert_eq!(link.sent().len(), 4);
    }

    #[tokio::test]
    async fn test_memory_link_failure_injection() {
        let link = MemoryLink::new();
        link.fail_on("CAL:AUTO CH1", "relay stuck");
        let err = link.command("CAL:AUTO CH1").await.unwrap_err();
        assert!(err.to_string().contains("relay stuck"));
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        // TEST-NET-1 address, guaranteed unroutable.
        let err = probe("192.0.2.1:5025", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Driver(_)));
    }
}
