// Engine invoker: runs the external rendering engine and captures its output.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::error::PipelineError;

/// Number of trailing output lines attached to an exit error.
const EXIT_ERROR_TAIL_LINES: usize = 20;

/// One engine run: open `scene_file`, execute `script` in batch mode, and
/// for the base run pass the configuration artifact after the delimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub scene_file: PathBuf,
    pub script: PathBuf,
    pub config: Option<PathBuf>,
}

impl Invocation {
    pub fn base(scene_file: &Path, script: &Path, config: &Path) -> Self {
        Self {
            scene_file: scene_file.to_path_buf(),
            script: script.to_path_buf(),
            config: Some(config.to_path_buf()),
        }
    }

    pub fn pass(scene_file: &Path, script: &Path) -> Self {
        Self {
            scene_file: scene_file.to_path_buf(),
            script: script.to_path_buf(),
            config: None,
        }
    }

    /// `<scene> -b -P <script> [-- -i <config>]`
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            self.scene_file.clone().into(),
            "-b".into(),
            "-P".into(),
            self.script.clone().into(),
        ];
        if let Some(config) = &self.config {
            args.push("--".into());
            args.push("-i".into());
            args.push(config.clone().into());
        }
        args
    }
}

/// Per-job engine output: the append-only log file plus the most recent
/// lines kept in memory for error reports.
pub struct EngineLog {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
    recent: Mutex<VecDeque<String>>,
}

impl EngineLog {
    /// Create (or truncate) the log file at `path`.
    pub async fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: tokio::sync::Mutex::new(file),
            recent: Mutex::new(VecDeque::with_capacity(EXIT_ERROR_TAIL_LINES)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, line: &str) -> io::Result<()> {
        {
            let mut recent = self.recent.lock();
            if recent.len() == EXIT_ERROR_TAIL_LINES {
                recent.pop_front();
            }
            recent.push_back(line.to_string());
        }
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await
    }

    /// The last `n` captured lines, at most [`EXIT_ERROR_TAIL_LINES`].
    pub fn tail(&self, n: usize) -> Vec<String> {
        let recent = self.recent.lock();
        let start = recent.len().saturating_sub(n);
        recent.iter().skip(start).cloned().collect()
    }
}

/// One output pipe of the engine, read as raw lines so non-UTF-8 output
/// never stops the drain.
struct PipeLines<R> {
    reader: Option<BufReader<R>>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PipeLines<R> {
    fn new(pipe: R) -> Self {
        Self {
            reader: Some(BufReader::new(pipe)),
            buf: Vec::new(),
        }
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Drop the read end. A child still writing gets EPIPE instead of
    /// blocking.
    fn close(&mut self) {
        self.reader = None;
    }

    /// Next line with the line ending stripped, or `None` at EOF.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        self.buf.clear();
        if reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// Something that can run engine invocations.
#[async_trait]
pub trait SceneEngine: Send + Sync {
    /// Fail early if the engine cannot run at all.
    async fn check_available(&self) -> Result<(), PipelineError>;

    /// Run one invocation to completion. Any unsuccessful exit is an error.
    async fn invoke(&self, invocation: &Invocation, log: &EngineLog) -> Result<(), PipelineError>;
}

/// Runs the engine executable as a child process.
pub struct ProcessEngine {
    executable: PathBuf,
}

impl ProcessEngine {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

#[async_trait]
impl SceneEngine for ProcessEngine {
    async fn check_available(&self) -> Result<(), PipelineError> {
        match tokio::fs::metadata(&self.executable).await {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(PipelineError::EngineMissing(self.executable.clone())),
        }
    }

    async fn invoke(&self, invocation: &Invocation, log: &EngineLog) -> Result<(), PipelineError> {
        let t0 = Instant::now();
        let args = invocation.args();
        info!(
            "engine run: {} {}",
            self.executable.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = Command::new(&self.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    PipelineError::EngineMissing(self.executable.clone())
                } else {
                    PipelineError::workspace(
                        format!("spawning {}", self.executable.display()),
                        e,
                    )
                }
            })?;

        // Both pipes are drained to EOF whatever happens to the log, so the
        // child never blocks on a full pipe. A log write failure is reported
        // once the child has exited.
        let mut log_failure: Option<io::Error> = None;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let (Some(stdout), Some(stderr)) = (stdout, stderr) {
            let mut out = PipeLines::new(stdout);
            let mut err = PipeLines::new(stderr);

            while out.is_open() || err.is_open() {
                let (from_stdout, line) = tokio::select! {
                    line = out.next_line(), if out.is_open() => (true, line),
                    line = err.next_line(), if err.is_open() => (false, line),
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    eof_or_error => {
                        if let Err(e) = eof_or_error {
                            warn!(
                                "engine {} read failed: {}",
                                if from_stdout { "stdout" } else { "stderr" },
                                e
                            );
                        }
                        if from_stdout {
                            out.close();
                        } else {
                            err.close();
                        }
                        continue;
                    }
                };
                if log_failure.is_none() {
                    if let Err(e) = log.append(&line).await {
                        log_failure = Some(e);
                    }
                }
            }
        }

        let status = child.wait().await.map_err(|e| {
            PipelineError::workspace(format!("waiting for {}", self.executable.display()), e)
        })?;

        if let Some(e) = log_failure {
            return Err(PipelineError::workspace(
                format!("writing engine log {}", log.path().display()),
                e,
            ));
        }

        debug!(
            "engine exited status={} script={} elapsed_ms={}",
            status,
            invocation.script.display(),
            t0.elapsed().as_millis()
        );

        if status.success() {
            Ok(())
        } else {
            Err(PipelineError::EngineExit {
                script: invocation.script.clone(),
                code: status.code(),
                log: log.path().to_path_buf(),
                output_tail: log.tail(EXIT_ERROR_TAIL_LINES),
            })
        }
    }
}
