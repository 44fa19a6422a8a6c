//! Launches the local backend, learns its port from the handshake line and
//! waits until that port accepts TCP connections.
//!
//! The supervisor owns exactly one child process. It never restarts it: a
//! backend that dies later shows up as a closed event channel.

use std::{io, net::SocketAddr, path::PathBuf, process::Stdio, time::Duration};

use ghostframe_core::{
    BackendEndpoint, CoreError, MAX_HANDSHAKE_LINE_BYTES, PRINT_PORT_FLAG, PortAnnouncement,
    parse_port_announcement,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader},
    net::TcpStream,
    process::{Child, Command},
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};
use tracing::{debug, info, warn};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(150);
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendCommand {
    /// `interpreter script --print-port`
    Dev {
        interpreter: PathBuf,
        script: PathBuf,
    },
    /// `binary --print-port`
    Packaged { binary: PathBuf },
}

impl BackendCommand {
    fn program_and_args(&self) -> (PathBuf, Vec<String>) {
        match self {
            BackendCommand::Dev {
                interpreter,
                script,
            } => (
                interpreter.clone(),
                vec![
                    script.to_string_lossy().into_owned(),
                    PRINT_PORT_FLAG.to_owned(),
                ],
            ),
            BackendCommand::Packaged { binary } => {
                (binary.clone(), vec![PRINT_PORT_FLAG.to_owned()])
            }
        }
    }

    pub fn describe(&self) -> String {
        let (program, args) = self.program_and_args();
        format!("{} {}", program.display(), args.join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTimings {
    pub handshake_timeout: Duration,
    pub probe_interval: Duration,
    pub readiness_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("backend stdout was not captured")]
    MissingStdout,
    #[error("backend closed stdout before announcing its port")]
    ClosedBeforeHandshake,
    #[error("no port announcement within {0:?}")]
    TimedOut(Duration),
    #[error("failed to read backend stdout: {0}")]
    Read(#[source] io::Error),
    #[error("invalid port announcement {line:?}: {source}")]
    Invalid {
        line: String,
        #[source]
        source: CoreError,
    },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch backend `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("backend handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("backend on port {port} not reachable after {waited:?}")]
    ReadinessTimeout { port: u16, waited: Duration },
    #[error("backend already started")]
    AlreadyStarted,
}

impl SupervisorError {
    pub fn user_message(&self) -> String {
        format!("cannot start service: {self}")
    }
}

#[derive(Debug)]
pub struct BackendSupervisor {
    command: BackendCommand,
    extra_args: Vec<String>,
    timings: SupervisorTimings,
    child: Option<Child>,
    endpoint: Option<BackendEndpoint>,
    drain_tasks: Vec<JoinHandle<()>>,
}

impl BackendSupervisor {
    pub fn new(command: BackendCommand) -> Self {
        Self {
            command,
            extra_args: Vec::new(),
            timings: SupervisorTimings::default(),
            child: None,
            endpoint: None,
            drain_tasks: Vec::new(),
        }
    }

    /// Arguments appended after the port-announcement flag.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_timings(mut self, timings: SupervisorTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn endpoint(&self) -> Option<BackendEndpoint> {
        self.endpoint
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn start(&mut self) -> Result<BackendEndpoint, SupervisorError> {
        if self.child.is_some() {
            return Err(SupervisorError::AlreadyStarted);
        }

        let (program, mut args) = self.command.program_and_args();
        args.extend(self.extra_args.iter().cloned());
        let description = self.command.describe();

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Launch {
            command: description.clone(),
            source,
        })?;
        info!(pid = ?child.id(), command = %description, "backend spawned");

        let stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            self.drain_tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        debug!("backend stderr: {}", line);
                    }
                }
            }));
        }
        self.child = Some(child);

        match self.handshake_and_probe(stdout).await {
            Ok(endpoint) => {
                self.endpoint = Some(endpoint);
                Ok(endpoint)
            }
            Err(err) => {
                warn!("backend startup failed: {}", err);
                self.stop().await;
                Err(err)
            }
        }
    }

    async fn handshake_and_probe(
        &mut self,
        stdout: Option<tokio::process::ChildStdout>,
    ) -> Result<BackendEndpoint, SupervisorError> {
        let stdout = stdout.ok_or(HandshakeError::MissingStdout)?;
        let mut stdout = BufReader::new(stdout);
        let announcement =
            read_port_announcement(&mut stdout, self.timings.handshake_timeout).await?;
        info!(port = announcement.port, "backend announced port");

        // Anything printed after the handshake is not protocol; keep the pipe drained.
        self.drain_tasks.push(tokio::spawn(async move {
            let mut lines = stdout.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("backend stdout: {}", line);
            }
        }));

        let endpoint = BackendEndpoint::new(announcement.port);
        wait_for_port(
            endpoint.socket_addr(),
            self.timings.probe_interval,
            self.timings.readiness_timeout,
        )
        .await?;
        Ok(endpoint)
    }

    /// Terminates the backend. Safe to call repeatedly and without a child.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        self.endpoint = None;

        match child.try_wait() {
            Ok(Some(status)) => {
                info!(%status, "backend already exited");
                self.abort_drains();
                return;
            }
            Ok(None) => {}
            Err(err) => warn!("failed to poll backend status: {}", err),
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            if let Ok(pid) = libc::pid_t::try_from(pid) {
                // SAFETY: `pid` belongs to a child we spawned and have not reaped yet,
                // so it cannot have been recycled for an unrelated process.
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
                match timeout(self.timings.stop_grace, child.wait()).await {
                    Ok(Ok(status)) => {
                        info!(%status, "backend stopped");
                        self.abort_drains();
                        return;
                    }
                    Ok(Err(err)) => warn!("waiting for backend failed: {}", err),
                    Err(_) => warn!(
                        grace = ?self.timings.stop_grace,
                        "backend ignored SIGTERM; killing"
                    ),
                }
            }
        }

        match timeout(self.timings.stop_grace, child.kill()).await {
            Ok(Ok(())) => info!("backend killed"),
            Ok(Err(err)) => warn!("failed to kill backend: {}", err),
            Err(_) => warn!("backend did not exit after kill"),
        }
        self.abort_drains();
    }

    fn abort_drains(&mut self) {
        for task in self.drain_tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for BackendSupervisor {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        self.abort_drains();
    }
}

/// Reads exactly one line and decodes it as a port announcement.
///
/// At most `MAX_HANDSHAKE_LINE_BYTES + 1` bytes are buffered, so a child that
/// never prints a newline is rejected as soon as it passes the limit.
pub async fn read_port_announcement<R>(
    reader: &mut R,
    wait: Duration,
) -> Result<PortAnnouncement, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_HANDSHAKE_LINE_BYTES as u64 + 1;
    let mut buf = Vec::new();
    let read = timeout(wait, (&mut *reader).take(limit).read_until(b'\n', &mut buf)).await;
    match read {
        Err(_) => return Err(HandshakeError::TimedOut(wait)),
        Ok(Err(err)) => return Err(HandshakeError::Read(err)),
        Ok(Ok(0)) => return Err(HandshakeError::ClosedBeforeHandshake),
        Ok(Ok(_)) => {}
    }

    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }
    let line = String::from_utf8_lossy(&buf).into_owned();
    parse_port_announcement(&line).map_err(|source| HandshakeError::Invalid { line, source })
}

/// Connects to `addr` every `interval` until it succeeds or `budget` runs out.
pub async fn wait_for_port(
    addr: SocketAddr,
    interval: Duration,
    budget: Duration,
) -> Result<(), SupervisorError> {
    let started = Instant::now();
    let deadline = started + budget;
    let mut attempt: u32 = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SupervisorError::ReadinessTimeout {
                port: addr.port(),
                waited: started.elapsed(),
            });
        }

        attempt += 1;
        match timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                info!(
                    port = addr.port(),
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "backend ready"
                );
                return Ok(());
            }
            Ok(Err(err)) => debug!(attempt, port = addr.port(), "readiness probe failed: {err}"),
            Err(_) => debug!(attempt, port = addr.port(), "readiness probe timed out"),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        sleep(interval.min(remaining)).await;
    }
}
