// # Process Transport
//
// Forks a child process and exchanges newline-delimited JSON envelopes
// over its stdio pipes: the parent writes to the child's stdin and reads
// its stdout. Child application logging belongs on stderr, which is
// inherited (or discarded with `silent`). A watchdog task owns the child
// handle and emits the single `Exit` event after the stdout reader has
// drained.

use super::{SpawnOptions, Transport, TransportEvent, TransportEvents};
use crate::error::{ClusterError, Result};
use crate::message::Envelope;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace};

/// Parent-side handle to a forked child process.
pub struct ProcessTransport {
    pid: Option<u32>,
    stdin: Mutex<ChildStdin>,
    kill_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    alive: Arc<AtomicBool>,
}

impl ProcessTransport {
    /// Forks `file` with the given options and returns the sending handle
    /// plus the event stream.
    pub fn spawn(file: &Path, options: &SpawnOptions) -> Result<(Arc<Self>, TransportEvents)> {
        let program = options.exec_path.as_deref().unwrap_or(file);
        let mut command = Command::new(program);
        command.args(&options.args);
        command.envs(&options.env);
        command.envs(&options.cluster_data);
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if options.silent {
                Stdio::null()
            } else {
                Stdio::inherit()
            })
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            if let Some(uid) = options.uid {
                command.uid(uid);
            }
            if let Some(gid) = options.gid {
                command.gid(gid);
            }
            if options.detached {
                command.process_group(0);
            }
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClusterError::Transport("child stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClusterError::Transport("child stdout was not captured".to_string()))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));

        let reader_tx = event_tx.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Envelope>(line) {
                            Ok(envelope) => {
                                if reader_tx.send(TransportEvent::Message(envelope)).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                debug!(error = %err, "skipping unparseable child output line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = reader_tx.send(TransportEvent::Error(err.to_string()));
                        break;
                    }
                }
            }
        });

        let watchdog_alive = Arc::clone(&alive);
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = kill_rx => {
                    if let Err(err) = child.start_kill() {
                        debug!(error = %err, "kill of already-dead child");
                    }
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            // Drain buffered messages before announcing the exit.
            let _ = reader.await;
            watchdog_alive.store(false, Ordering::Release);
            let _ = event_tx.send(TransportEvent::Exit { code });
        });

        trace!(pid = ?pid, "forked child process");
        Ok((
            Arc::new(Self {
                pid,
                stdin: Mutex::new(stdin),
                kill_tx: parking_lot::Mutex::new(Some(kill_tx)),
                alive,
            }),
            event_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        if !self.is_alive() {
            return Err(ClusterError::Transport("child process has exited".to_string()));
        }
        let mut line = serde_json::to_string(envelope)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn kill(&self) {
        if let Some(kill_tx) = self.kill_tx.lock().take() {
            let _ = kill_tx.send(());
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTransport")
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Child-side endpoint of the process transport: envelopes arrive on
/// stdin, replies leave on stdout. `Exit` fires when stdin reaches EOF,
/// which means the parent is gone.
pub struct StdioTransport {
    stdout: Mutex<tokio::io::Stdout>,
}

impl StdioTransport {
    pub fn connect() -> (Arc<Self>, TransportEvents) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Envelope>(line) {
                            Ok(envelope) => {
                                if event_tx.send(TransportEvent::Message(envelope)).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                debug!(error = %err, "skipping unparseable stdin line");
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = event_tx.send(TransportEvent::Exit { code: None });
                        break;
                    }
                    Err(err) => {
                        let _ = event_tx.send(TransportEvent::Error(err.to_string()));
                        let _ = event_tx.send(TransportEvent::Exit { code: None });
                        break;
                    }
                }
            }
        });

        (
            Arc::new(Self {
                stdout: Mutex::new(tokio::io::stdout()),
            }),
            event_rx,
        )
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let mut line = serde_json::to_string(envelope)?;
        line.push('\n');
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }

    async fn kill(&self) {
        // The child cannot kill its parent; exiting is the host's call.
        debug!("kill() is a no-op on the child-side stdio transport");
    }

    fn is_alive(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport").finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::message::EnvelopeKind;
    use serde_json::json;
    use std::time::Duration;

    async fn next_event(rx: &mut TransportEvents) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn test_round_trip_through_cat() {
        let (transport, mut rx) =
            ProcessTransport::spawn(Path::new("/bin/cat"), &SpawnOptions::default()).unwrap();

        let envelope = Envelope::result_reply("n1", json!([1, 2, 3]));
        transport.send(&envelope).await.unwrap();

        match next_event(&mut rx).await {
            TransportEvent::Message(echoed) => assert_eq!(echoed, envelope),
            other => panic!("unexpected event: {:?}", other),
        }

        transport.kill().await;
        match next_event(&mut rx).await {
            TransportEvent::Exit { .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!transport.is_alive());
        assert!(transport.send(&envelope).await.is_err());
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let options = SpawnOptions {
            args: vec!["-c".to_string(), "exit 3".to_string()],
            ..Default::default()
        };
        let (_transport, mut rx) = ProcessTransport::spawn(Path::new("/bin/sh"), &options).unwrap();

        match next_event(&mut rx).await {
            TransportEvent::Exit { code } => assert_eq!(code, Some(3)),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_json_lines_are_skipped() {
        let options = SpawnOptions {
            args: vec![
                "-c".to_string(),
                "echo not-json; echo '{\"_ready\":true}'".to_string(),
            ],
            ..Default::default()
        };
        let (_transport, mut rx) = ProcessTransport::spawn(Path::new("/bin/sh"), &options).unwrap();

        match next_event(&mut rx).await {
            TransportEvent::Message(envelope) => {
                assert_eq!(envelope.kind(), EnvelopeKind::Ready)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match next_event(&mut rx).await {
            TransportEvent::Exit { code } => assert_eq!(code, Some(0)),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_messages_drain_before_exit() {
        let options = SpawnOptions {
            args: vec![
                "-c".to_string(),
                "for i in 1 2 3 4 5; do echo '{\"_result\":'$i',\"nonce\":\"x\"}'; done".to_string(),
            ],
            ..Default::default()
        };
        let (_transport, mut rx) = ProcessTransport::spawn(Path::new("/bin/sh"), &options).unwrap();

        let mut messages = 0;
        loop {
            match next_event(&mut rx).await {
                TransportEvent::Message(_) => messages += 1,
                TransportEvent::Exit { .. } => break,
                TransportEvent::Error(err) => panic!("unexpected error: {}", err),
            }
        }
        assert_eq!(messages, 5);
    }

    #[tokio::test]
    async fn test_cwd_option_applies() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().canonicalize().unwrap();
        let options = SpawnOptions {
            args: vec!["-c".to_string(), "echo '{\"message\":\"'$(pwd -P)'\"}'".to_string()],
            cwd: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let (_transport, mut rx) = ProcessTransport::spawn(Path::new("/bin/sh"), &options).unwrap();
        match next_event(&mut rx).await {
            TransportEvent::Message(envelope) => {
                assert_eq!(
                    envelope.str_field("message"),
                    expected.to_str(),
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cluster_data_overrides_env() {
        let mut options = SpawnOptions {
            args: vec!["-c".to_string(), "echo '{\"message\":\"'$WHO'\"}'".to_string()],
            ..Default::default()
        };
        options.env.insert("WHO".to_string(), "base".to_string());
        options
            .cluster_data
            .insert("WHO".to_string(), "override".to_string());

        let (_transport, mut rx) = ProcessTransport::spawn(Path::new("/bin/sh"), &options).unwrap();
        match next_event(&mut rx).await {
            TransportEvent::Message(envelope) => {
                assert_eq!(envelope.str_field("message"), Some("override"))
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
