//! Child processes: launching them with their standard streams wired up, chaining them into
//! pipelines, and waiting for them.
//!
//! A [`ProcessBuilder`] describes one child. Its stdin can be a data source (fed through an
//! [`InputPipe`]), a descriptor, or another [`Process`] whose captured stdout it consumes; its
//! stdout and stderr can be inherited, captured into an [`OutputPipe`], or sent to a descriptor.
//!
//! ```no_run
//! use procpipe::proc::{Output, ProcessBuilder};
//!
//! let upper = ProcessBuilder::new(["tr", "a-z", "A-Z"])
//!     .stdin("hello")
//!     .stdout(Output::Capture)
//!     .spawn()
//!     .unwrap();
//! let mut cat = ProcessBuilder::new(["cat"])
//!     .stdin(upper)
//!     .stdout(Output::Capture)
//!     .spawn()
//!     .unwrap();
//! assert_eq!(cat.wait().unwrap().stdout.as_deref(), Some(&b"HELLO"[..]));
//! ```

use crate::env::Env;
use crate::fds::{FdMode, FileDescriptor, FIRST_HIGH_FD};
use crate::flog::FLOG;
use crate::fork_exec::{bshell, default_backend, spawn_child, SpawnBackend, SpawnFailure, SpawnRequest};
use crate::pipe::{replay_io_error, DirectedPipe, InputPipe, OutputPipe, Pipe, WriteSource};
use crate::threads::BackgroundTask;
use errno::{errno, Errno};
use libc::{pid_t, EINTR, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

/// What to run: an argument vector, or a script for a shell.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Argv(Vec<OsString>),
    Shell {
        shell: Vec<OsString>,
        script: OsString,
    },
}

impl Command {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Command::Argv(argv.into_iter().map(Into::into).collect())
    }

    /// Run `script` with `/bin/sh -c`.
    pub fn shell(script: impl Into<OsString>) -> Self {
        let sh = OsStr::from_bytes(bshell().to_bytes()).to_owned();
        Command::Shell {
            shell: vec![sh, "-c".into()],
            script: script.into(),
        }
    }

    /// Run `script` with another shell. A lone shell name gets `-c` appended.
    pub fn shell_with<I, S>(shell: I, script: impl Into<OsString>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut shell: Vec<OsString> = shell.into_iter().map(Into::into).collect();
        if shell.len() == 1 {
            shell.push("-c".into());
        }
        Command::Shell {
            shell,
            script: script.into(),
        }
    }

    /// The argument vector the child is started with.
    pub fn argv(&self) -> Vec<OsString> {
        match self {
            Command::Argv(argv) => argv.clone(),
            Command::Shell { shell, script } => {
                let mut argv = shell.clone();
                argv.push(script.clone());
                argv
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Argv(argv) => {
                let words: Vec<_> = argv.iter().map(|a| a.to_string_lossy()).collect();
                f.write_str(&words.join(" "))
            }
            Command::Shell { script, .. } => f.write_str(&script.to_string_lossy()),
        }
    }
}

/// Where a child's stdin comes from.
pub enum Input {
    Inherit,
    /// Data streamed in by a background writer.
    Source(WriteSource),
    /// A readable descriptor, duplicated into the child.
    Fd(FileDescriptor),
    /// The captured stdout of another process.
    Process(Box<Process>),
}

impl From<WriteSource> for Input {
    fn from(source: WriteSource) -> Self {
        Input::Source(source)
    }
}

impl From<Vec<u8>> for Input {
    fn from(data: Vec<u8>) -> Self {
        Input::Source(data.into())
    }
}

impl From<&[u8]> for Input {
    fn from(data: &[u8]) -> Self {
        Input::Source(data.into())
    }
}

impl<const N: usize> From<&[u8; N]> for Input {
    fn from(data: &[u8; N]) -> Self {
        Input::Source(data.into())
    }
}

impl From<&str> for Input {
    fn from(data: &str) -> Self {
        Input::Source(data.into())
    }
}

impl From<FileDescriptor> for Input {
    fn from(fd: FileDescriptor) -> Self {
        Input::Fd(fd)
    }
}

impl From<File> for Input {
    fn from(file: File) -> Self {
        Input::Fd(FileDescriptor::new(OwnedFd::from(file), FdMode::Read))
    }
}

/// The read end of a pipe; whoever holds the write end decides when the child sees EOF.
impl From<Pipe> for Input {
    fn from(mut pipe: Pipe) -> Self {
        Input::Fd(pipe.take_read_fd())
    }
}

impl From<Process> for Input {
    fn from(process: Process) -> Self {
        Input::Process(Box::new(process))
    }
}

/// Where a child's stdout or stderr goes.
#[derive(Debug)]
pub enum Output {
    Inherit,
    /// Collected by [`Process::wait`].
    Capture,
    /// A writable descriptor, duplicated into the child.
    Fd(FileDescriptor),
}

impl From<FileDescriptor> for Output {
    fn from(fd: FileDescriptor) -> Self {
        Output::Fd(fd)
    }
}

impl From<File> for Output {
    fn from(file: File) -> Self {
        Output::Fd(FileDescriptor::new(OwnedFd::from(file), FdMode::Write))
    }
}

/// A value type that encapsulates logic around exited vs stopped vs signaled.
/// It contains the raw status from waitpid().
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcStatus(i32);

impl ProcStatus {
    /// Construct from a status returned from a waitpid call.
    pub fn from_waitpid(status: i32) -> ProcStatus {
        ProcStatus(status)
    }

    /// Return if we are stopped (as in SIGSTOP).
    pub fn stopped(&self) -> bool {
        WIFSTOPPED(self.0)
    }

    /// Return if we exited normally (not a signal).
    pub fn normal_exited(&self) -> bool {
        WIFEXITED(self.0)
    }

    /// Return if we exited because of a signal.
    pub fn signal_exited(&self) -> bool {
        WIFSIGNALED(self.0)
    }

    /// Return the signal code, given that we signal exited.
    pub fn signal_code(&self) -> libc::c_int {
        assert!(self.signal_exited(), "Process is not signal exited");
        WTERMSIG(self.0)
    }

    /// Return the exit code, given that we normal exited.
    pub fn exit_code(&self) -> u8 {
        assert!(self.normal_exited(), "Process is not normal exited");
        WEXITSTATUS(self.0) as u8
    }

    /// Return if this status represents success.
    pub fn is_success(&self) -> bool {
        self.normal_exited() && self.exit_code() == 0
    }

    /// The exit code, or the negated number of the signal that ended or stopped the process.
    pub fn code(&self) -> i32 {
        if self.normal_exited() {
            i32::from(self.exit_code())
        } else if self.signal_exited() {
            -self.signal_code()
        } else if self.stopped() {
            -WSTOPSIG(self.0)
        } else {
            self.0
        }
    }
}

/// What a finished process left behind. A nonzero status is data, not an error; use
/// [`ProcResult::check`] to turn it into one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcResult {
    pub command: Command,
    pub status: ProcStatus,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

impl ProcResult {
    /// See [`ProcStatus::code`].
    pub fn code(&self) -> i32 {
        self.status.code()
    }

    pub fn success(&self) -> bool {
        self.status.is_success()
    }

    /// Fail with a [`ResultError`] unless the process exited with status 0.
    pub fn check(self) -> Result<ProcResult, ResultError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ResultError(self))
        }
    }
}

impl fmt::Display for ProcResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let argv: Vec<_> = self.command.argv().into_iter().map(|a| a.to_string_lossy().into_owned()).collect();
        write!(f, "Result(argv={:?}, status={}", argv, self.code())?;
        if let Some(stdout) = &self.stdout {
            write!(f, ", stdout={:?}", String::from_utf8_lossy(stdout))?;
        }
        if let Some(stderr) = &self.stderr {
            write!(f, ", stderr={:?}", String::from_utf8_lossy(stderr))?;
        }
        f.write_str(")")
    }
}

/// A process that did not exit successfully, from [`ProcResult::check`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResultError(pub ProcResult);

impl fmt::Display for ResultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' exited with status {}", self.0.command, self.0.code())
    }
}

impl std::error::Error for ResultError {}

#[derive(Debug)]
pub enum ProcessError {
    /// A pipe or descriptor could not be allocated.
    Pipe(nix::Error),
    /// The argument vector was empty or contained a NUL byte.
    InvalidCommand(Command),
    /// A forced backend that this platform does not have.
    Unavailable(SpawnBackend),
    /// Every backend tried failed to start the command.
    Spawn {
        command: Command,
        failures: Vec<(SpawnBackend, Errno)>,
    },
    /// The upstream process of a chain does not have its stdout captured.
    NoUpstreamOutput,
    Wait(Errno),
    Kill(Errno),
    /// A background writer or reader failed.
    Io(io::Error),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::Pipe(err) => write!(f, "could not create pipe: {}", err),
            ProcessError::InvalidCommand(command) => write!(f, "invalid command '{}'", command),
            ProcessError::Unavailable(backend) => {
                write!(f, "spawn backend {} is not available on this platform", backend)
            }
            ProcessError::Spawn { command, failures } => {
                write!(f, "failed to start '{}'", command)?;
                for (backend, err) in failures {
                    write!(f, "; {}: {}", backend, err)?;
                }
                Ok(())
            }
            ProcessError::NoUpstreamOutput => {
                f.write_str("upstream process does not have its stdout captured")
            }
            ProcessError::Wait(err) => write!(f, "waitpid failed: {}", err),
            ProcessError::Kill(err) => write!(f, "kill failed: {}", err),
            ProcessError::Io(err) => write!(f, "{}", err),
        }
    }
}

impl ProcessError {
    /// The same error again, for reporting a cached failure.
    fn replay(&self) -> ProcessError {
        match self {
            ProcessError::Pipe(err) => ProcessError::Pipe(*err),
            ProcessError::InvalidCommand(command) => ProcessError::InvalidCommand(command.clone()),
            ProcessError::Unavailable(backend) => ProcessError::Unavailable(*backend),
            ProcessError::Spawn { command, failures } => ProcessError::Spawn {
                command: command.clone(),
                failures: failures.clone(),
            },
            ProcessError::NoUpstreamOutput => ProcessError::NoUpstreamOutput,
            ProcessError::Wait(err) => ProcessError::Wait(*err),
            ProcessError::Kill(err) => ProcessError::Kill(*err),
            ProcessError::Io(err) => ProcessError::Io(replay_io_error(err)),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Pipe(err) => Some(err),
            ProcessError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<nix::Error> for ProcessError {
    fn from(err: nix::Error) -> Self {
        ProcessError::Pipe(err)
    }
}

impl From<io::Error> for ProcessError {
    fn from(err: io::Error) -> Self {
        ProcessError::Io(err)
    }
}

/// Describes a child process; [`ProcessBuilder::spawn`] starts it.
pub struct ProcessBuilder {
    command: Command,
    stdin: Input,
    stdout: Output,
    stderr: Output,
    env: Env,
    backend: SpawnBackend,
}

impl ProcessBuilder {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self::from_command(Command::new(argv))
    }

    /// See [`Command::shell`].
    pub fn shell(script: impl Into<OsString>) -> Self {
        Self::from_command(Command::shell(script))
    }

    /// All streams inherited, an empty environment and the default backend.
    pub fn from_command(command: Command) -> Self {
        ProcessBuilder {
            command,
            stdin: Input::Inherit,
            stdout: Output::Inherit,
            stderr: Output::Inherit,
            env: Env::new(),
            backend: default_backend(),
        }
    }

    pub fn stdin(mut self, input: impl Into<Input>) -> Self {
        self.stdin = input.into();
        self
    }

    pub fn stdout(mut self, output: impl Into<Output>) -> Self {
        self.stdout = output.into();
        self
    }

    pub fn stderr(mut self, output: impl Into<Output>) -> Self {
        self.stderr = output.into();
        self
    }

    /// The child's entire environment.
    pub fn env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    pub fn backend(mut self, backend: SpawnBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Start the child.
    ///
    /// Once it is running, our copies of the descriptors it inherited are closed, so that
    /// end-of-stream and broken pipes are decided by the children alone. If no backend can start
    /// it, every descriptor opened for it is closed and any stdin writer joined before the error
    /// is returned.
    pub fn spawn(self) -> Result<Process, ProcessError> {
        let ProcessBuilder {
            command,
            stdin,
            stdout,
            stderr,
            env,
            backend,
        } = self;

        let (mut stdout_pipe, stdout_fd) = wire_output(stdout)?;
        let (mut stderr_pipe, stderr_fd) = wire_output(stderr)?;

        let mut upstream = None;
        let mut input_pipe = None;
        let mut stdin_fd = None;
        match stdin {
            Input::Inherit => (),
            Input::Source(source) => input_pipe = Some(InputPipe::new(source)?),
            Input::Fd(fd) => stdin_fd = Some(high_fd(fd, FdMode::Read)?),
            Input::Process(mut up) => {
                let reader = up.stdout.take().map(|mut pipe| pipe.take_reader());
                match reader {
                    Some(reader) if reader.readable() => stdin_fd = Some(high_fd(reader, FdMode::Read)?),
                    _ => return Err(ProcessError::NoUpstreamOutput),
                }
                upstream = Some(up);
            }
        }

        let streams = [
            remote_fd(input_pipe.as_ref().map(|p| p as &dyn DirectedPipe), &stdin_fd),
            remote_fd(stdout_pipe.as_ref().map(|p| p as &dyn DirectedPipe), &stdout_fd),
            remote_fd(stderr_pipe.as_ref().map(|p| p as &dyn DirectedPipe), &stderr_fd),
        ];
        let argv = command.argv();
        let spawned = match SpawnRequest::new(&argv, &env, streams) {
            Ok(req) => spawn_child(backend, &req).map_err(|failure| match failure {
                SpawnFailure::Unavailable(backend) => ProcessError::Unavailable(backend),
                SpawnFailure::Failed(failures) => ProcessError::Spawn {
                    command: command.clone(),
                    failures,
                },
            }),
            Err(_) => Err(ProcessError::InvalidCommand(command.clone())),
        };

        // The child has its own copies now, or there is no child.
        if let Some(pipe) = input_pipe.as_mut() {
            pipe.close_remote();
        }
        for pipe in [stdout_pipe.as_mut(), stderr_pipe.as_mut()].into_iter().flatten() {
            pipe.close_remote();
        }
        drop((stdin_fd, stdout_fd, stderr_fd));

        let (pid, backend) = match spawned {
            Ok(spawned) => spawned,
            Err(err) => {
                FLOG!(exec, err);
                if let Some(mut pipe) = input_pipe {
                    // Its reader is gone, so the writer stops at its next write.
                    if let Err(err) = pipe.close_local() {
                        FLOG!(warning, "stdin writer failed:", err);
                    }
                }
                return Err(err);
            }
        };

        Ok(Process {
            command,
            pid,
            backend,
            upstream,
            stdin: input_pipe,
            stdout: stdout_pipe,
            stderr: stderr_pipe,
            stdout_reader: None,
            stderr_reader: None,
            status: None,
            result: None,
            error: None,
        })
    }

    /// Spawn and wait.
    pub fn run(self) -> Result<ProcResult, ProcessError> {
        let mut process = self.spawn()?;
        process.wait().cloned()
    }
}

fn wire_output(output: Output) -> Result<(Option<OutputPipe>, Option<FileDescriptor>), ProcessError> {
    Ok(match output {
        Output::Inherit => (None, None),
        Output::Capture => (Some(OutputPipe::new()?), None),
        Output::Fd(fd) => (None, Some(high_fd(fd, FdMode::Write)?)),
    })
}

/// Check that a caller's descriptor suits `mode` and move it out of the standard stream range,
/// so that installing one child stream can never clobber the source of another.
fn high_fd(fd: FileDescriptor, mode: FdMode) -> Result<FileDescriptor, ProcessError> {
    let Some(raw) = fd.raw() else {
        return Err(io::Error::from_raw_os_error(libc::EBADF).into());
    };
    if fd.mode() != mode {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("descriptor {} has mode {:?}, need {:?}", raw, fd.mode(), mode),
        )
        .into());
    }
    if raw >= FIRST_HIGH_FD {
        return Ok(fd);
    }
    Ok(fd.try_clone()?)
}

fn remote_fd(pipe: Option<&dyn DirectedPipe>, fd: &Option<FileDescriptor>) -> Option<RawFd> {
    pipe.map(|p| p.remote()).or(fd.as_ref()).and_then(FileDescriptor::raw)
}

/// Wait for `pid` to exit, retrying on EINTR.
fn wait_pid(pid: pid_t) -> Result<ProcStatus, Errno> {
    let mut status = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret >= 0 {
            FLOG!(proc_reap, "Reaped pid", pid, "with status", status);
            return Ok(ProcStatus::from_waitpid(status));
        }
        let err = errno();
        if err.0 != EINTR {
            return Err(err);
        }
    }
}

type Reader = BackgroundTask<io::Result<Vec<u8>>>;

fn join_reader(reader: &mut Option<Reader>) -> Result<Option<Vec<u8>>, ProcessError> {
    let Some(mut reader) = reader.take() else {
        return Ok(None);
    };
    match reader.join() {
        Some(res) => Ok(Some(res??)),
        None => Ok(None),
    }
}

/// Remember the first error, carry on with the rest of the cleanup.
fn keep_first<T>(first: &mut Option<ProcessError>, res: Result<T, ProcessError>) -> Option<T> {
    match res {
        Ok(value) => Some(value),
        Err(err) => {
            first.get_or_insert(err);
            None
        }
    }
}

/// A running (or finished) child process, and the processes upstream of it in its chain.
pub struct Process {
    command: Command,
    pid: pid_t,
    backend: SpawnBackend,
    upstream: Option<Box<Process>>,
    stdin: Option<InputPipe>,
    stdout: Option<OutputPipe>,
    stderr: Option<OutputPipe>,
    stdout_reader: Option<Reader>,
    stderr_reader: Option<Reader>,
    status: Option<ProcStatus>,
    result: Option<ProcResult>,
    /// Why `wait` failed, reported again by later calls.
    error: Option<ProcessError>,
}

impl Process {
    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    /// The backend that started this process.
    pub fn backend(&self) -> SpawnBackend {
        self.backend
    }

    /// The process feeding our stdin, if we are not the first in the chain.
    pub fn upstream(&self) -> Option<&Process> {
        self.upstream.as_deref()
    }

    /// Wait for the whole chain to exit, draining every captured output, and return our result.
    ///
    /// All captured outputs in the chain are read concurrently (ours on the calling thread, the
    /// rest on background readers), so no child can stall on a full pipe while we are blocked
    /// elsewhere. Later calls return the same result without blocking.
    ///
    /// A failure is also final: later calls report the same error.
    pub fn wait(&mut self) -> Result<&ProcResult, ProcessError> {
        if !self.finished() {
            if let Err(err) = self.finish() {
                self.error = Some(err);
            }
        }
        if let Some(err) = &self.error {
            return Err(err.replay());
        }
        self.result
            .as_ref()
            .ok_or(ProcessError::Wait(Errno(libc::ECHILD)))
    }

    fn finished(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }

    /// The child's status, once it has been reaped.
    pub fn status(&self) -> Option<ProcStatus> {
        self.status
    }

    /// Like [`Process::wait`], returning the results of every process in the chain, first to last.
    pub fn wait_all(&mut self) -> Result<Vec<&ProcResult>, ProcessError> {
        self.wait()?;
        let mut results = vec![];
        self.collect_results(&mut results);
        Ok(results)
    }

    fn collect_results<'a>(&'a self, results: &mut Vec<&'a ProcResult>) {
        if let Some(up) = &self.upstream {
            up.collect_results(results);
        }
        if let Some(result) = &self.result {
            results.push(result);
        }
    }

    /// The commands of the chain, first to last.
    pub fn argv_all(&self) -> Vec<&Command> {
        let mut commands = match &self.upstream {
            Some(up) => up.argv_all(),
            None => vec![],
        };
        commands.push(&self.command);
        commands
    }

    /// Send `signal` to the child. Does nothing once it has been reaped.
    pub fn kill(&self, signal: Signal) -> Result<(), ProcessError> {
        if self.status.is_some() {
            return Ok(());
        }
        FLOG!(proc_reap, "Sending", signal.as_str(), "to pid", self.pid);
        match nix::sys::signal::kill(Pid::from_raw(self.pid), signal) {
            Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
            Err(err) => Err(ProcessError::Kill(Errno(err as i32))),
        }
    }

    /// Close our ends of every pipe in the chain, e.g. to abort it. Children writing to a
    /// captured output get a broken pipe; nothing more is read from them. Safe to call at any
    /// time, any number of times.
    pub fn close_pipes(&mut self) {
        if let Some(up) = self.upstream.as_mut() {
            up.close_pipes();
        }
        if let Some(pipe) = self.stdin.as_mut() {
            pipe.close_remote();
        }
        for pipe in [self.stdout.as_mut(), self.stderr.as_mut()].into_iter().flatten() {
            let _ = pipe.close_local();
        }
    }

    fn finish(&mut self) -> Result<(), ProcessError> {
        let mut first_error = None;
        if keep_first(&mut first_error, self.start_readers(true)).is_none() {
            // We cannot drain everything, so make sure nobody blocks on a full pipe.
            self.close_pipes();
        }
        let stdout = match self.stdout.as_mut() {
            Some(pipe) if pipe.readable() => keep_first(&mut first_error, pipe.read().map_err(Into::into)),
            _ => None,
        };
        keep_first(&mut first_error, self.collect(stdout));
        first_error.map_or(Ok(()), Err)
    }

    /// Start background readers for the captured outputs of the chain, except our stdout when we
    /// are the last process.
    fn start_readers(&mut self, last: bool) -> Result<(), ProcessError> {
        if let Some(up) = self.upstream.as_mut() {
            if !up.finished() {
                up.start_readers(false)?;
            }
        }
        if !last {
            if let Some(pipe) = self.stdout.as_mut().filter(|p| p.readable()) {
                self.stdout_reader = Some(pipe.read_in_background()?);
            }
        }
        if let Some(pipe) = self.stderr.as_mut().filter(|p| p.readable()) {
            self.stderr_reader = Some(pipe.read_in_background()?);
        }
        Ok(())
    }

    /// Reap the chain, upstream first, and record each result.
    fn collect(&mut self, stdout: Option<Vec<u8>>) -> Result<(), ProcessError> {
        let mut first_error = None;
        if let Some(up) = self.upstream.as_mut() {
            if !up.finished() {
                keep_first(&mut first_error, up.collect(None));
            }
        }
        let stdout = match stdout {
            Some(data) => Some(data),
            None => keep_first(&mut first_error, join_reader(&mut self.stdout_reader)).flatten(),
        };
        let stderr = keep_first(&mut first_error, join_reader(&mut self.stderr_reader)).flatten();
        let status = self.reap();
        if let Some(pipe) = self.stdin.as_mut() {
            keep_first(&mut first_error, pipe.close_local().map_err(Into::into));
        }
        // Keep whatever was collected, even when something else failed.
        match status {
            Ok(status) => {
                self.result = Some(ProcResult {
                    command: self.command.clone(),
                    status,
                    stdout,
                    stderr,
                })
            }
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => {
                self.error = Some(err.replay());
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn reap(&mut self) -> Result<ProcStatus, ProcessError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = wait_pid(self.pid).map_err(ProcessError::Wait)?;
        self.status = Some(status);
        Ok(status)
    }
}

/// A process that was never waited for is killed unless it has already exited, then reaped, so
/// no child outlives its handle as a zombie. Upstream processes follow as their boxes drop.
impl Drop for Process {
    fn drop(&mut self) {
        if self.status.is_some() {
            return;
        }
        self.close_pipes();
        let mut status = 0;
        let ret = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
        if ret == self.pid {
            FLOG!(proc_reap, "Reaped pid", self.pid, "on drop");
            return;
        }
        if ret == 0 {
            FLOG!(proc_reap, "Killing pid", self.pid, "on drop");
            unsafe { libc::kill(self.pid, libc::SIGKILL) };
        }
        if let Err(err) = wait_pid(self.pid) {
            FLOG!(warning, "Could not reap pid", self.pid, ":", err);
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("backend", &self.backend)
            .field("upstream", &self.upstream)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, ProcResult, ProcStatus};
    use std::ffi::OsString;

    #[test]
    fn test_shell_commands() {
        let cmd = Command::shell("echo hi");
        let argv = cmd.argv();
        assert_eq!(argv.len(), 3);
        assert_eq!(argv[1], "-c");
        assert_eq!(argv[2], "echo hi");

        let cmd = Command::shell_with(["bash"], "exit 3");
        assert_eq!(cmd.argv(), ["bash", "-c", "exit 3"].map(OsString::from));
        let cmd = Command::shell_with(["bash", "-ec"], "true");
        assert_eq!(cmd.argv(), ["bash", "-ec", "true"].map(OsString::from));
    }

    #[test]
    fn test_result_display_and_check() {
        let ok = ProcResult {
            command: Command::new(["cat"]),
            status: ProcStatus::from_waitpid(0),
            stdout: Some(b"hello".to_vec()),
            stderr: None,
        };
        assert_eq!(ok.to_string(), r#"Result(argv=["cat"], status=0, stdout="hello")"#);
        assert!(ok.clone().check().is_ok());

        // Exit status 3 in the traditional waitpid encoding.
        let failed = ProcResult {
            status: ProcStatus::from_waitpid(3 << 8),
            stdout: None,
            ..ok
        };
        assert_eq!(failed.code(), 3);
        let err = failed.clone().check().unwrap_err();
        assert_eq!(err.0, failed);
        assert_eq!(err.to_string(), "'cat' exited with status 3");
    }
}
