//! Starting workers and talking to them.
//!
//! A [`WorkerLauncher`] produces a [`LaunchedWorker`]: the message channel
//! ([`WorkerIo`]) plus a handle on whatever runs the worker ([`WorkerProcess`]).
//! The two halves are kept apart so a hung worker can be killed while a caller
//! is still blocked reading from its channel.
use crate::error::{EmbedError, Result};
use crate::protocol::{WorkerRequest, WorkerResponse, decode_line, encode_line};
use crate::worker::WorkerServer;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Name of the worker executable built by this crate.
pub const WORKER_BINARY: &str = "docsearch-embed-worker";

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The pool's end of a worker channel.
pub struct WorkerIo {
    worker_id: usize,
    writer: BoxedWriter,
    lines: Lines<BufReader<BoxedReader>>,
}

impl WorkerIo {
    pub fn new(worker_id: usize, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            worker_id,
            writer,
            lines: BufReader::new(reader).lines(),
        }
    }

    pub async fn send(&mut self, request: &WorkerRequest) -> Result<()> {
        let line = encode_line(request)?;
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.crashed(format!("write failed: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| self.crashed(format!("flush failed: {e}")))
    }

    /// Next response. A closed channel means the worker is gone.
    pub async fn recv(&mut self) -> Result<WorkerResponse> {
        match self.lines.next_line().await {
            Ok(Some(line)) => decode_line(&line),
            Ok(None) => Err(self.crashed("channel closed".to_string())),
            Err(e) => Err(self.crashed(format!("read failed: {e}"))),
        }
    }

    fn crashed(&self, reason: String) -> EmbedError {
        EmbedError::WorkerCrashed {
            worker: self.worker_id,
            reason,
        }
    }
}

/// Whatever executes a worker: an OS process or a tokio task.
pub enum WorkerProcess {
    Child(Child),
    Task(JoinHandle<Result<()>>),
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        match self {
            WorkerProcess::Child(child) => child.id(),
            WorkerProcess::Task(_) => None,
        }
    }

    pub fn has_exited(&mut self) -> bool {
        match self {
            WorkerProcess::Child(child) => !matches!(child.try_wait(), Ok(None)),
            WorkerProcess::Task(handle) => handle.is_finished(),
        }
    }

    /// Force termination. Does not wait.
    pub fn kill(&mut self) {
        match self {
            WorkerProcess::Child(child) => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!("Worker process already gone: {}", e);
                }
            }
            WorkerProcess::Task(handle) => handle.abort(),
        }
    }
}

pub struct LaunchedWorker {
    pub io: WorkerIo,
    pub process: WorkerProcess,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, worker_id: usize) -> Result<LaunchedWorker>;

    fn describe(&self) -> String;
}

/// Runs each worker as a `docsearch-embed-worker` subprocess speaking the
/// protocol over stdin/stdout. Worker stderr (its logs) is inherited.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Find the worker binary next to the running executable, or one directory
    /// up (where cargo places binaries relative to test executables).
    pub fn locate() -> Result<Self> {
        let exe = std::env::current_exe()?;
        let file_name = format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX);
        exe.ancestors()
            .skip(1)
            .take(2)
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
            .map(Self::new)
            .ok_or_else(|| {
                EmbedError::invalid_config(format!(
                    "could not find {file_name} next to {}",
                    exe.display()
                ))
            })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, worker_id: usize) -> Result<LaunchedWorker> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EmbedError::protocol("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EmbedError::protocol("worker stdout unavailable"))?;
        tracing::debug!(
            "Spawned embedding worker {} as pid {:?}",
            worker_id,
            child.id()
        );

        Ok(LaunchedWorker {
            io: WorkerIo::new(worker_id, Box::new(stdout), Box::new(stdin)),
            process: WorkerProcess::Child(child),
        })
    }

    fn describe(&self) -> String {
        format!("process:{}", self.program.display())
    }
}

/// Runs each worker's [`WorkerServer`] on a tokio task connected through an
/// in-memory pipe. Same protocol, no process boundary.
#[derive(Debug, Clone, Default)]
pub struct InProcessLauncher {
    server: WorkerServer,
}

impl InProcessLauncher {
    pub fn new(server: WorkerServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, worker_id: usize) -> Result<LaunchedWorker> {
        let (client, server_side) = tokio::io::duplex(1 << 20);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (client_read, client_write) = tokio::io::split(client);

        let server = self.server.clone();
        let handle = tokio::spawn(async move {
            let result = server.serve(BufReader::new(server_read), server_write).await;
            if let Err(e) = &result {
                tracing::warn!("In-process worker {} exited with error: {}", worker_id, e);
            }
            result
        });

        Ok(LaunchedWorker {
            io: WorkerIo::new(worker_id, Box::new(client_read), Box::new(client_write)),
            process: WorkerProcess::Task(handle),
        })
    }

    fn describe(&self) -> String {
        "in-process".to_string()
    }
}
