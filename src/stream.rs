//! The subprocess-backed stream reader.
//!
//! One [`Stream`] owns one `pg_recvlogical` process attached to one
//! replication slot. Its stdout carries frames of
//! `[u64 big-endian length N][1 marker byte][N bytes of payload]`, each
//! payload being one serialized row message from the decoding plugin. The
//! reader deframes stdout into decoded change records, republishes stderr
//! line by line, and reports termination exactly once through a finished
//! signal.
//!
//! Internally four tasks cooperate per stream: a frame reader and a
//! stderr reader draining the pipes, a decoder turning raw frames into
//! records, and a watcher blocking on process exit. The pipe readers hand
//! off through FIFOs so a slow consumer never blocks them.

use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use prost::Message as _;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::fifo::{self, Fifo, FifoReceiver};
use crate::position::LogPos;
use crate::proto;
use crate::record::ChangeRecord;

/// Receiving ends handed out by [`Stream::start`].
pub struct StreamOutput {
    /// Decoded change records, in frame order.
    pub records: mpsc::UnboundedReceiver<ChangeRecord>,
    /// Backend stderr, one line per item, trailing newline stripped.
    pub stderr_lines: FifoReceiver<String>,
    /// Fires exactly once when the backend has exited and the pipeline is
    /// torn down. `None` means a clean exit with no captured fault.
    pub finished: oneshot::Receiver<Option<Error>>,
}

impl StreamOutput {
    /// An output whose channels are already closed, standing in for a
    /// stream that could not be started at all.
    pub(crate) fn closed() -> Self {
        let (records_tx, records) = mpsc::unbounded_channel();
        drop(records_tx);
        let (lines, stderr_lines) = fifo::open::<String>();
        drop(lines);
        let (finished_tx, finished) = oneshot::channel();
        drop(finished_tx);
        Self {
            records,
            stderr_lines,
            finished,
        }
    }
}

/// One `pg_recvlogical` instance streaming one replication slot.
pub struct Stream {
    program: PathBuf,
    config: DatabaseConfig,
    slot: String,
    start_pos: LogPos,
    running: bool,
    pid: Option<Pid>,
}

impl Stream {
    pub fn new(
        config: &DatabaseConfig,
        program: impl Into<PathBuf>,
        slot: impl Into<String>,
        start_pos: LogPos,
    ) -> Self {
        Self {
            program: program.into(),
            config: config.clone(),
            slot: slot.into(),
            start_pos,
            running: false,
            pid: None,
        }
    }

    /// Spawns the backend and launches the decoding pipeline.
    ///
    /// Fails fast with [`Error::AlreadyRunning`] on an active instance and
    /// with the underlying I/O error if the process cannot be spawned or
    /// its pipes attached.
    pub fn start(&mut self) -> Result<StreamOutput> {
        if self.running {
            return Err(Error::AlreadyRunning);
        }

        let mut child = self.build_command().spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("backend stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("backend stderr unavailable"))?;
        let pid = child.id().map(|id| Pid::from_raw(id as i32));
        self.pid = pid;
        self.running = true;
        info!(slot = %self.slot, start_pos = %self.start_pos, "backend started");

        let (frames, frames_rx) = fifo::open::<Bytes>();
        let (lines, lines_rx) = fifo::open::<String>();
        let (records_tx, records_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = oneshot::channel();

        let faults = FaultHandle {
            fault: Arc::default(),
            pid,
        };

        let pipeline = Pipeline {
            stdout: tokio::spawn(read_frames(stdout, frames.clone(), faults.clone())),
            stderr: tokio::spawn(read_stderr(stderr, lines.clone(), faults.clone())),
            decode: tokio::spawn(decode_frames(frames_rx, records_tx, faults.clone())),
        };
        tokio::spawn(watch_exit(child, pipeline, frames, lines, faults, finished_tx));

        Ok(StreamOutput {
            records: records_rx,
            stderr_lines: lines_rx,
            finished: finished_rx,
        })
    }

    /// Asks the backend to shut down by sending it SIGINT. Does not block;
    /// await the finished signal to know resources are released.
    pub fn stop(&self) -> Result<()> {
        interrupt(self.pid)
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--start")
            .arg("--file=-")
            .arg("-S")
            .arg(&self.slot)
            .arg("-d")
            .arg(&self.config.database)
            .arg("-F")
            .arg("0");
        if !self.config.user.is_empty() {
            cmd.arg("-U").arg(&self.config.user);
        }
        if !self.config.host.is_empty() {
            cmd.arg("-h").arg(&self.config.host);
        }
        if self.config.port > 0 {
            cmd.arg("-p").arg(self.config.port.to_string());
        }
        if !self.start_pos.is_zero() {
            cmd.arg(format!("--startpos={}", self.start_pos));
        }
        if !self.config.password.is_empty() {
            // The password never appears on the command line.
            cmd.env("PGPASSWORD", &self.config.password);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn interrupt(pid: Option<Pid>) -> Result<()> {
    match pid {
        Some(pid) => kill(pid, Signal::SIGINT)
            .map_err(|errno| Error::Io(io::Error::from_raw_os_error(errno as i32))),
        None => Ok(()),
    }
}

/// Records the first internal fault and interrupts the backend so the
/// exit watcher can report it.
#[derive(Clone)]
struct FaultHandle {
    fault: Arc<Mutex<Option<Error>>>,
    pid: Option<Pid>,
}

impl FaultHandle {
    async fn trip(&self, err: Error) {
        debug!(%err, "stream fault");
        {
            let mut slot = self.fault.lock().await;
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        if let Err(e) = interrupt(self.pid) {
            warn!("failed to interrupt backend: {e}");
        }
    }
}

/// Upper bound on a frame's announced payload length. The server caps
/// individual field values at 1 GiB, so anything larger is a corrupt or
/// misaligned length prefix.
const MAX_FRAME_LEN: u64 = 1 << 30;

async fn read_frames(stdout: ChildStdout, frames: Fifo<Bytes>, faults: FaultHandle) {
    let mut reader = BufReader::new(stdout);
    loop {
        let mut header = [0u8; 8];
        // The first byte is read alone to tell a clean end-of-stream at a
        // frame boundary apart from a torn length prefix.
        match reader.read(&mut header[..1]).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                faults.trip(e.into()).await;
                return;
            }
        }
        if let Err(e) = reader.read_exact(&mut header[1..]).await {
            faults.trip(framing_fault(e, 8)).await;
            return;
        }
        let len = u64::from_be_bytes(header);
        if len > MAX_FRAME_LEN {
            faults.trip(Error::OversizedFrame { len }).await;
            return;
        }
        let len = len as usize;

        let mut frame = vec![0u8; len + 1];
        if let Err(e) = reader.read_exact(&mut frame).await {
            faults.trip(framing_fault(e, len + 1)).await;
            return;
        }
        trace!(len, "frame received");
        // The leading marker byte is not part of the payload.
        if !frames.send(Bytes::from(frame).slice(1..)).await {
            return;
        }
    }
}

fn framing_fault(e: io::Error, wanted: usize) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::ShortFrame { wanted }
    } else {
        Error::Io(e)
    }
}

async fn read_stderr(stderr: ChildStderr, lines: Fifo<String>, faults: FaultHandle) {
    let mut reader = BufReader::new(stderr).lines();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if !lines.send(line).await {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                faults.trip(e.into()).await;
                return;
            }
        }
    }
}

async fn decode_frames(
    mut frames: FifoReceiver<Bytes>,
    records: mpsc::UnboundedSender<ChangeRecord>,
    faults: FaultHandle,
) {
    while let Some(frame) = frames.recv().await {
        let row = match proto::RowMessage::decode(frame.as_ref()) {
            Ok(row) => row,
            Err(e) => {
                faults.trip(e.into()).await;
                return;
            }
        };
        let record = match ChangeRecord::try_from(row) {
            Ok(record) => record,
            Err(e) => {
                faults.trip(e).await;
                return;
            }
        };
        if records.send(record).is_err() {
            return;
        }
    }
}

/// Handles of the three per-stream pipeline tasks, joined by the exit
/// watcher so every fault they trip lands before the finished signal.
struct Pipeline {
    stdout: tokio::task::JoinHandle<()>,
    stderr: tokio::task::JoinHandle<()>,
    decode: tokio::task::JoinHandle<()>,
}

/// How long after process exit the pipe readers may keep draining. The
/// pipes normally hit end-of-stream immediately; they stay open only when
/// a grandchild inherited them, and nothing useful follows from one.
const DRAIN_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

async fn watch_exit(
    mut child: Child,
    mut pipeline: Pipeline,
    frames: Fifo<Bytes>,
    lines: Fifo<String>,
    faults: FaultHandle,
    finished: oneshot::Sender<Option<Error>>,
) {
    let status = child.wait().await;
    // Let the readers drain whatever the process left in its pipes, then
    // close the FIFOs so the decoder runs out behind them.
    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        let _ = (&mut pipeline.stdout).await;
        let _ = (&mut pipeline.stderr).await;
    })
    .await;
    if drained.is_err() {
        debug!("pipes still open after backend exit, abandoning readers");
        pipeline.stdout.abort();
        pipeline.stderr.abort();
        let _ = pipeline.stdout.await;
        let _ = pipeline.stderr.await;
    }
    frames.close().await;
    lines.close().await;
    let _ = pipeline.decode.await;

    let fault = faults.fault.lock().await.take();
    let outcome = match status {
        Ok(status) if status.success() => fault,
        Ok(status) => Some(fault.unwrap_or(Error::BackendExit { status })),
        Err(e) => Some(Error::Io(e)),
    };
    match &outcome {
        Some(err) => debug!(%err, "backend finished with fault"),
        None => debug!("backend finished cleanly"),
    }
    let _ = finished.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            database: "app".to_string(),
            user: "streamer".to_string(),
            password: "secret".to_string(),
            host: "db.internal".to_string(),
            port: 5433,
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn command_carries_documented_flags() {
        let stream = Stream::new(&config(), "pg_recvlogical", "events", LogPos::ZERO);
        let cmd = stream.build_command();
        let args = args_of(&cmd);
        assert_eq!(
            args,
            [
                "--start", "--file=-", "-S", "events", "-d", "app", "-F", "0", "-U", "streamer",
                "-h", "db.internal", "-p", "5433",
            ]
        );
    }

    #[test]
    fn password_travels_via_environment_only() {
        let stream = Stream::new(&config(), "pg_recvlogical", "events", LogPos::ZERO);
        let cmd = stream.build_command();
        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(envs.contains(&(OsStr::new("PGPASSWORD"), Some(OsStr::new("secret")))));
        assert!(args_of(&cmd).iter().all(|a| !a.contains("secret")));
    }

    #[test]
    fn start_position_flag_only_when_nonzero() {
        let stream = Stream::new(&config(), "pg_recvlogical", "events", LogPos::ZERO);
        assert!(!args_of(&stream.build_command())
            .iter()
            .any(|a| a.starts_with("--startpos")));

        let stream = Stream::new(
            &config(),
            "pg_recvlogical",
            "events",
            LogPos::new(0x17_A4C4_1EC0),
        );
        assert!(args_of(&stream.build_command()).contains(&"--startpos=17/A4C41EC0".to_string()));
    }

    #[test]
    fn defaulted_options_are_omitted() {
        let stream = Stream::new(&DatabaseConfig::new("app"), "pg_recvlogical", "s", LogPos::ZERO);
        let cmd = stream.build_command();
        let args = args_of(&cmd);
        assert!(!args.contains(&"-h".to_string()));
        assert!(!args.contains(&"-p".to_string()));
        assert!(cmd
            .as_std()
            .get_envs()
            .all(|(k, _)| k != OsStr::new("PGPASSWORD")));
    }
}
