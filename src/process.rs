//! Backing-process lifecycle management.
//!
//! Every client connection (TCP/WS) or HTTP session is served by exactly one
//! spawned OS process. The `ProcessManager` owns the registry of live
//! processes, spawns them with piped stdio, and guarantees idempotent
//! teardown no matter which event path triggers it first: explicit close,
//! process exit, stderr output, or a transport error.
//!
//! On unix each child is started in its own session (`setsid`) so `kill`
//! can signal the whole process tree through the process group.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;

use crate::logsink::{tight_json, InteractionLog};
use crate::service::ServiceDefinition;

/// One spawned OS process bound to one client connection or HTTP session.
pub struct BackingProcess {
    /// Globally unique id derived from spawn time and OS pid.
    pub id: String,
    pub protocol: crate::service::Protocol,
    pub route: String,
    pub port: u16,
    pub command: String,
    pub client_ip: String,
    pid: u32,
    cleaned: AtomicBool,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    log: Mutex<Option<InteractionLog>>,
    exit_tx: watch::Sender<bool>,
}

impl BackingProcess {
    /// Write one line to the process stdin, re-terminated `\r\n`, and record
    /// it in the interaction log.
    pub async fn write_line(&self, data: &str) -> Result<(), String> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| "stdin closed".to_string())?;
        stdin
            .write_all(format!("{}\r\n", data).as_bytes())
            .await
            .map_err(|e| format!("failed to write to process stdin: {}", e))?;
        stdin
            .flush()
            .await
            .map_err(|e| format!("failed to flush process stdin: {}", e))?;
        self.log_client(data);
        Ok(())
    }

    /// Record one process → client line in the interaction log.
    pub fn log_server(&self, data: &str) {
        if let Ok(guard) = self.log.lock() {
            if let Some(log) = guard.as_ref() {
                log.server(data);
            }
        }
    }

    fn log_client(&self, data: &str) {
        if let Ok(guard) = self.log.lock() {
            if let Some(log) = guard.as_ref() {
                log.client(data);
            }
        }
    }

    /// Receiver that flips to `true` once the process has exited.
    pub fn exit_rx(&self) -> watch::Receiver<bool> {
        self.exit_tx.subscribe()
    }

    /// Emit one structured status line for this process, mirroring the
    /// fields of the startup banner: protocol, port, route, command, client
    /// ip, process id, status code, comment.
    pub fn status_line(&self, code: u16, comment: &str) {
        tracing::info!(
            protocol = %self.protocol,
            port = self.port,
            route = %self.route,
            command = %self.command,
            ip = %self.client_ip,
            process_id = %self.id,
            status = code,
            "{}",
            comment
        );
    }
}

/// A freshly spawned process plus the output streams its owner wires up.
pub struct SpawnedProcess {
    pub proc: Arc<BackingProcess>,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Process-wide registry and lifecycle operations.
pub struct ProcessManager {
    registry: Mutex<Vec<Arc<BackingProcess>>>,
    log_root: Option<PathBuf>,
}

impl ProcessManager {
    pub fn new(log_root: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Vec::new()),
            log_root,
        })
    }

    /// Launch the service's command for one client and register it.
    ///
    /// Spawn failures propagate; they are not retried. A detached task waits
    /// for the child so exits are observed even when nobody is bridging.
    pub fn spawn(
        self: &Arc<Self>,
        def: &ServiceDefinition,
        client_ip: &str,
    ) -> Result<SpawnedProcess, String> {
        let mut cmd = Command::new(&def.args[0]);
        cmd.args(&def.args[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                // New session so the whole tree is reachable via the group.
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn {:?}: {}", def.command, e))?;

        let pid = child.id().unwrap_or(0);
        let started_at = Local::now();
        let id = format!("{}-{}", started_at.format("%Y%m%dT%H%M%S"), pid);

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "child stdout not captured".to_string())?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| "child stderr not captured".to_string())?;

        let log = match &self.log_root {
            Some(root) => {
                match InteractionLog::open(root, &def.protocol.to_string(), &def.route, &id) {
                    Ok(log) => Some(log),
                    Err(e) => {
                        tracing::warn!(process_id = %id, "{}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let (exit_tx, _) = watch::channel(false);
        let proc = Arc::new(BackingProcess {
            id,
            protocol: def.protocol,
            route: def.route.clone(),
            port: def.port,
            command: def.command.clone(),
            client_ip: client_ip.to_string(),
            pid,
            cleaned: AtomicBool::new(false),
            stdin: tokio::sync::Mutex::new(stdin),
            log: Mutex::new(log),
            exit_tx,
        });

        if let Ok(mut registry) = self.registry.lock() {
            registry.push(proc.clone());
        }
        proc.status_line(201, "spawning");

        // Exit waiter: owns the child, observes its exit, tears down.
        let manager = Arc::clone(self);
        let waited = proc.clone();
        tokio::spawn(async move {
            let _ = child.wait().await;
            // Teardown before the notification so watchers observing the
            // exit already see the registry without this process.
            manager.teardown(&waited, None);
            let _ = waited.exit_tx.send(true);
        });

        Ok(SpawnedProcess { proc, stdout, stderr })
    }

    /// Idempotent teardown: exactly one "closing" status emission, one
    /// registry removal, and one log closure per process, regardless of how
    /// many trigger paths race here. Returns whether this call did the work.
    pub fn teardown(&self, proc: &Arc<BackingProcess>, error: Option<&str>) -> bool {
        if proc.cleaned.swap(true, Ordering::SeqCst) {
            return false;
        }
        match error {
            Some(e) => proc.status_line(500, &format!("closing due to ERROR: {}", tight_json(e))),
            None => proc.status_line(204, "closing"),
        }
        if let Ok(mut registry) = self.registry.lock() {
            registry.retain(|p| !Arc::ptr_eq(p, proc));
        }
        if let Ok(mut log) = proc.log.lock() {
            log.take();
        }
        true
    }

    /// Teardown plus forcible termination of the process group.
    pub fn kill(&self, proc: &Arc<BackingProcess>, error: Option<&str>) {
        self.teardown(proc, error);
        #[cfg(unix)]
        if proc.pid > 0 {
            unsafe {
                libc::kill(-(proc.pid as i32), libc::SIGKILL);
            }
        }
    }

    /// Kill every live process, most recently spawned first. Used once, at
    /// shutdown.
    pub fn kill_all(&self) {
        let snapshot: Vec<Arc<BackingProcess>> = match self.registry.lock() {
            Ok(registry) => registry.iter().rev().cloned().collect(),
            Err(_) => return,
        };
        for proc in snapshot {
            self.kill(&proc, None);
        }
    }

    /// Number of live (not yet torn down) processes.
    pub fn live_count(&self) -> usize {
        self.registry.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{parse_service, Protocol};
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn cat_service() -> ServiceDefinition {
        parse_service("echo:cat", Protocol::Tcp, 9001).unwrap()
    }

    #[tokio::test]
    async fn test_spawn_write_and_read_back() {
        let manager = ProcessManager::new(None);
        let spawned = manager.spawn(&cat_service(), "127.0.0.1").unwrap();
        assert_eq!(manager.live_count(), 1);

        spawned.proc.write_line("hi").await.unwrap();
        let mut lines = BufReader::new(spawned.stdout).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, "hi");

        manager.kill(&spawned.proc, None);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let manager = ProcessManager::new(None);
        let spawned = manager.spawn(&cat_service(), "127.0.0.1").unwrap();
        let proc = spawned.proc.clone();

        assert!(manager.teardown(&proc, None));
        assert!(!manager.teardown(&proc, None));
        assert!(!manager.teardown(&proc, Some("late error")));
        assert_eq!(manager.live_count(), 0);

        manager.kill(&proc, None);
    }

    #[tokio::test]
    async fn test_two_spawns_are_independent() {
        let manager = ProcessManager::new(None);
        let a = manager.spawn(&cat_service(), "127.0.0.1").unwrap();
        let b = manager.spawn(&cat_service(), "127.0.0.2").unwrap();
        assert_ne!(a.proc.id, b.proc.id);
        assert_eq!(manager.live_count(), 2);
        manager.kill_all();
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_exit_watch_fires() {
        let manager = ProcessManager::new(None);
        let def = parse_service("true:true", Protocol::Tcp, 9001).unwrap();
        let spawned = manager.spawn(&def, "127.0.0.1").unwrap();
        let mut exit_rx = spawned.proc.exit_rx();
        exit_rx.wait_for(|exited| *exited).await.unwrap();
        // The waiter's teardown removed it from the registry.
        assert_eq!(manager.live_count(), 0);
    }
}
