//! Local process execution and the command runner abstraction.
//!
//! Every program the crate launches on the build host (`ssh`, `scp`,
//! `nix-store`, `ssh-keygen`) goes through [`CommandRunner`] so tests can
//! substitute scripted runners without spawning processes.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A single local process invocation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables layered over the inherited environment.
    pub env: Vec<(String, String)>,
    /// Bytes written to the process' standard input, if any.
    pub stdin: Option<Vec<u8>>,
    /// Upper bound on the run time; the process is killed when exceeded.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Starts a specification for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends a single argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<OsString>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child process.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Supplies standard input for the child process.
    #[must_use]
    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    /// Bounds the run time of the child process.
    #[must_use]
    pub const fn timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    /// Returns a shell-like rendering of the invocation for logs and
    /// assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit status for error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised while launching or supervising a local process.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProcessError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when talking to the child over its pipes fails.
    #[error("i/o error while running {program}: {message}")]
    Io {
        /// Command being supervised.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the child outlives its timeout and is killed.
    #[error("{program} timed out after {seconds} seconds")]
    TimedOut {
        /// Command that was killed.
        program: String,
        /// Timeout that was exceeded.
        seconds: u64,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs the described command, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the command cannot be started, its pipes
    /// fail, or it exceeds its timeout.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(key, value)| (key, value)))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ProcessError::Spawn {
                program: spec.program.clone(),
                message: err.to_string(),
            })?;

        let writer = spec
            .stdin
            .clone()
            .and_then(|bytes| child.stdin.take().map(|pipe| feed(pipe, bytes)));
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = wait_for_exit(&mut child, spec)?;

        if let Some(handle) = writer {
            // A child that exits without reading its input closes the pipe;
            // that is not an error for the caller.
            join(handle, spec)?.ok();
        }

        Ok(CommandOutput {
            code: status.code(),
            stdout: collect(stdout, spec)?,
            stderr: collect(stderr, spec)?,
        })
    }
}

fn feed<W: Write + Send + 'static>(mut pipe: W, bytes: Vec<u8>) -> JoinHandle<io::Result<()>> {
    thread::spawn(move || pipe.write_all(&bytes))
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        pipe.read_to_end(&mut buffer)?;
        Ok(buffer)
    })
}

fn join<T>(handle: JoinHandle<T>, spec: &CommandSpec) -> Result<T, ProcessError> {
    handle.join().map_err(|_| ProcessError::Io {
        program: spec.program.clone(),
        message: String::from("pipe worker panicked"),
    })
}

fn collect(
    handle: Option<JoinHandle<io::Result<Vec<u8>>>>,
    spec: &CommandSpec,
) -> Result<String, ProcessError> {
    let Some(worker) = handle else {
        return Ok(String::new());
    };
    let bytes = join(worker, spec)?.map_err(|err| io_error(spec, &err))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn wait_for_exit(child: &mut Child, spec: &CommandSpec) -> Result<ExitStatus, ProcessError> {
    let Some(limit) = spec.timeout else {
        return child.wait().map_err(|err| io_error(spec, &err));
    };

    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().map_err(|err| io_error(spec, &err))? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            child.kill().ok();
            child.wait().ok();
            return Err(ProcessError::TimedOut {
                program: spec.program.clone(),
                seconds: limit.as_secs(),
            });
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn io_error(spec: &CommandSpec, err: &io::Error) -> ProcessError {
    ProcessError::Io {
        program: spec.program.clone(),
        message: err.to_string(),
    }
}
