//! Line-delimited JSON request/response channel to a worker process
//!
//! Requests are written as `{"id": n, "cmd": "...", ...params}` and answered
//! with `{"id": n, "ok": true, "result": ...}` or
//! `{"id": n, "ok": false, "error": "..."}`. Requests may be pipelined; the
//! background reader routes each response to its caller by id.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

type Waiter = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct PendingTable {
    /// Set once the channel is unusable; holds the reason
    closed: Option<String>,
    waiters: HashMap<u64, Waiter>,
}

impl PendingTable {
    fn terminate(&mut self, reason: &str) {
        if self.closed.is_none() {
            self.closed = Some(reason.to_string());
        }
        let drained = self.waiters.len();
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(Error::TransportTerminated(reason.to_string())));
        }
        if drained > 0 {
            debug!("Rejected {} pending request(s): {}", drained, reason);
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: Option<u64>,
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Request/response channel over a pair of byte streams
pub struct RemoteChannel {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Arc<Mutex<PendingTable>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader_task: JoinHandle<()>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl RemoteChannel {
    /// Wrap an already-connected stream pair and start the response reader
    pub fn new<R, W>(reader: R, writer: W, request_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_child(reader, writer, request_timeout, None)
    }

    fn with_child<R, W>(reader: R, writer: W, request_timeout: Duration, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let reader_task = tokio::spawn(read_responses(reader, pending.clone()));

        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout,
            reader_task,
            child: tokio::sync::Mutex::new(child),
        }
    }

    /// Spawn a worker with piped stdin/stdout and inherited stderr
    pub fn spawn(mut command: Command, request_timeout: Duration) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Driver(format!("failed to spawn worker: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Driver("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Driver("worker stdout not captured".to_string()))?;

        debug!("Spawned worker (pid: {:?})", child.id());
        Ok(Self::with_child(stdout, stdin, request_timeout, Some(child)))
    }

    /// Send one command and wait for its response
    pub async fn request(&self, cmd: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut message = Map::new();
        message.insert("id".to_string(), Value::from(id));
        message.insert("cmd".to_string(), Value::String(cmd.to_string()));
        if let Value::Object(params) = params {
            for (k, v) in params {
                if k != "id" && k != "cmd" {
                    message.insert(k, v);
                }
            }
        }
        let mut line = serde_json::to_string(&Value::Object(message))?;
        line.push('\n');

        let rx = {
            let mut pending = self.pending.lock();
            if let Some(reason) = &pending.closed {
                return Err(Error::TransportTerminated(reason.clone()));
            }
            let (tx, rx) = oneshot::channel();
            pending.waiters.insert(id, tx);
            rx
        };

        trace!("-> #{} {}", id, line.trim_end());
        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().terminate(&format!("write failed: {e}"));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::TransportTerminated("response channel dropped".to_string())),
            Err(_) => {
                self.pending.lock().waiters.remove(&id);
                Err(Error::Driver(format!(
                    "'{}' (#{}) timed out after {}ms",
                    cmd,
                    id,
                    self.request_timeout.as_millis()
                )))
            }
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    /// Number of requests still awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.lock().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed.is_some()
    }

    /// Stop the worker: SIGTERM, a short grace period, then kill.
    ///
    /// Outstanding requests are rejected with a terminal error.
    pub async fn kill(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            debug!("Stopping worker (pid: {:?})", child.id());

            // Try graceful shutdown first
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if let Some(pid) = child.id() {
                    if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                        let _ = tokio::time::timeout(Duration::from_millis(500), child.wait()).await;
                    }
                }
            }

            if let Err(e) = child.kill().await {
                debug!("Worker already exited: {}", e);
            }
        }
        drop(guard);

        self.pending.lock().terminate("worker process killed");
        Ok(())
    }
}

impl Drop for RemoteChannel {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.pending.lock().terminate("channel dropped");
    }
}

async fn read_responses<R>(reader: R, pending: Arc<Mutex<PendingTable>>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                trace!("<- {}", line);
                dispatch(line, &pending);
            }
            Ok(None) => break "worker closed its output".to_string(),
            Err(e) => break format!("read failed: {e}"),
        }
    };

    pending.lock().terminate(&reason);
}

fn dispatch(line: &str, pending: &Mutex<PendingTable>) {
    let response: WireResponse = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            warn!("Ignoring malformed worker output: {}", e);
            return;
        }
    };

    let Some(id) = response.id else {
        warn!(
            "Worker reported an error without request id: {}",
            response.error.unwrap_or_default()
        );
        return;
    };

    let Some(waiter) = pending.lock().waiters.remove(&id) else {
        debug!("Dropping response for unknown id {}", id);
        return;
    };

    let outcome = if response.ok {
        Ok(response.result.unwrap_or(Value::Null))
    } else {
        Err(Error::Driver(
            response.error.unwrap_or_else(|| "worker reported failure".to_string()),
        ))
    };
    let _ = waiter.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, split};

    #[tokio::test]
    async fn test_unknown_ids_are_dropped() {
        let (near, far) = duplex(4096);
        let (r, w) = split(near);
        let channel = Arc::new(RemoteChannel::new(r, w, Duration::from_secs(5)));

        let (far_r, mut far_w) = split(far);
        let worker = tokio::spawn(async move {
            let mut lines = BufReader::new(far_r).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            let id = req["id"].as_u64().unwrap();
            far_w
                .write_all(b"{\"id\": 999, \"ok\": true, \"result\": \"stray\"}\nnot json\n")
                .await
                .unwrap();
            let reply = json!({ "id": id, "ok": true, "result": "https://example.test/" });
            far_w.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
            far_w.flush().await.unwrap();
            far_w
        });

        let url = channel.request("url", json!({})).await.unwrap();
        assert_eq!(url, json!("https://example.test/"));
        assert_eq!(channel.pending_count(), 0);
        drop(worker.await.unwrap());
    }

    #[tokio::test]
    async fn test_worker_error_maps_to_driver_error() {
        let (near, far) = duplex(4096);
        let (r, w) = split(near);
        let channel = RemoteChannel::new(r, w, Duration::from_secs(5));

        let (far_r, mut far_w) = split(far);
        tokio::spawn(async move {
            let mut lines = BufReader::new(far_r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let reply = json!({ "id": req["id"], "ok": false, "error": "no such element" });
                far_w.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
            }
        });

        let err = channel
            .request("click", json!({ "selector": "#missing" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Driver(ref m) if m == "no such element"));
    }

    #[tokio::test]
    async fn test_request_timeout_clears_entry() {
        let (near, _far) = duplex(4096);
        let (r, w) = split(near);
        let channel = RemoteChannel::new(r, w, Duration::from_millis(50));

        let err = channel.request("title", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Driver(_)));
        assert_eq!(channel.pending_count(), 0);
        assert!(!channel.is_closed());
    }
}
