//! Suspended launcher - create a process that has not run a single instruction yet.
//!
//! The launcher turns a [`LaunchRequest`] into a [`SuspendedProcess`], an owned
//! handle that must be consumed exactly once: either released with
//! [`SuspendedProcess::resume`] or killed with [`SuspendedProcess::terminate`].
//! Dropping it unconsumed terminates the child, so no path leaks a stopped process.
//!
//! Platform backends:
//! - Linux: `fork` + `PTRACE_TRACEME` + `execve`, then detach into `SIGSTOP` (nix)
//! - Windows: `CreateProcessW` with `CREATE_SUSPENDED` (windows-rs)

mod environment;

#[cfg(target_os = "linux")]
mod unix;

#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "linux")]
use self::unix as platform;

#[cfg(target_os = "windows")]
use self::windows as platform;

pub use environment::EnvironmentBlock;

#[cfg(target_os = "linux")]
pub use self::unix::observe;

use std::fmt;
use std::io;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Launch errors
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("No executable path given")]
    EmptyExecutable,

    #[error("Executable not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("Permission denied launching {}", .path.display())]
    PermissionDenied { path: PathBuf },

    #[error("Not an executable file: {}", .path.display())]
    NotExecutable { path: PathBuf },

    #[error("Working directory is not usable: {}", .path.display())]
    WorkingDirectory { path: PathBuf },

    #[error("Malformed environment entry {entry:?}: {reason}")]
    MalformedEnvironment { entry: String, reason: &'static str },

    #[error("Argument contains an interior NUL byte: {0:?}")]
    InvalidArgument(String),

    #[error("Out of process resources launching {}: {reason}", .path.display())]
    ResourceExhausted { path: PathBuf, reason: String },

    #[error("Executable could not be loaded: {}", .path.display())]
    ExecFailed { path: PathBuf },

    #[error("Process {pid} exited before it could be suspended ({status})")]
    EarlyExit { pid: u32, status: String },

    #[error("Failed to launch {}: {reason}", .path.display())]
    Os { path: PathBuf, reason: String },

    #[error("Suspended launch is not supported on this platform")]
    Unsupported,
}

/// Errors from operations on an already launched process
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to resume process {pid}: {reason}")]
    ResumeFailed { pid: ProcessId, reason: String },

    #[error("Failed to terminate process {pid}: {reason}")]
    TerminateFailed { pid: ProcessId, reason: String },

    #[error("Failed to wait for process {pid}: {reason}")]
    WaitFailed { pid: ProcessId, reason: String },
}

/// OS process identifier of a launched child. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(NonZeroU32);

impl ProcessId {
    /// Wrap a raw id; `0` is the failure sentinel and yields `None`.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Normal exit with a status code
    Code(i32),
    /// Killed by a signal (Unix signal number)
    Signal(i32),
}

impl ProcessExit {
    /// Exit code, if the process exited normally
    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessExit::Code(code) => Some(*code),
            ProcessExit::Signal(_) => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Code(0))
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Code(code) => write!(f, "exit code {}", code),
            ProcessExit::Signal(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// Scheduler state of a process as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Job-control stop (`T`)
    Stopped,
    /// Stopped under a tracer (`t`)
    Traced,
    /// Running or sleeping
    Running,
    /// Exited but not yet reaped
    Zombie,
    /// No such process
    Gone,
}

/// Everything needed to start one target. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    executable: PathBuf,
    working_directory: Option<PathBuf>,
    environment: EnvironmentBlock,
}

impl LaunchRequest {
    /// Request with inherited working directory and environment
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            working_directory: None,
            environment: EnvironmentBlock::inherit(),
        }
    }

    /// Build from the three resolved strings a configuration provider hands over.
    /// Empty `working_directory` and `environment` mean "inherit".
    pub fn from_strings(
        executable: &str,
        working_directory: &str,
        environment: &str,
    ) -> Result<Self, LaunchError> {
        let request = Self::new(executable)
            .with_environment(environment.parse::<EnvironmentBlock>()?);

        if working_directory.is_empty() {
            Ok(request)
        } else {
            Ok(request.with_working_directory(working_directory))
        }
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.working_directory = if dir.as_os_str().is_empty() {
            None
        } else {
            Some(dir)
        };
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentBlock) -> Self {
        self.environment = environment;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    pub fn environment(&self) -> &EnvironmentBlock {
        &self.environment
    }

    /// Check the request against the filesystem without creating anything.
    pub fn validate(&self) -> Result<(), LaunchError> {
        if self.executable.as_os_str().is_empty() {
            return Err(LaunchError::EmptyExecutable);
        }

        let metadata = std::fs::metadata(&self.executable).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound {
                path: self.executable.clone(),
            },
            io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied {
                path: self.executable.clone(),
            },
            _ => LaunchError::Os {
                path: self.executable.clone(),
                reason: e.to_string(),
            },
        })?;

        if !metadata.is_file() || !is_executable(&self.executable, &metadata) {
            return Err(LaunchError::NotExecutable {
                path: self.executable.clone(),
            });
        }

        if let Some(dir) = &self.working_directory {
            if !dir.is_dir() {
                return Err(LaunchError::WorkingDirectory { path: dir.clone() });
            }
        }

        Ok(())
    }
}

/// Executable by the calling user, not just by somebody
#[cfg(target_os = "linux")]
fn is_executable(path: &Path, _metadata: &std::fs::Metadata) -> bool {
    use nix::unistd::{access, AccessFlags};
    access(path, AccessFlags::X_OK).is_ok()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_executable(_path: &Path, metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_path: &Path, _metadata: &std::fs::Metadata) -> bool {
    true
}

/// Creates processes in the suspended state
#[derive(Debug, Default, Clone, Copy)]
pub struct SuspendedLauncher;

impl SuspendedLauncher {
    pub fn new() -> Self {
        Self
    }

    /// Create the target suspended. On error no process and no handle is left behind.
    pub fn launch(&self, request: &LaunchRequest) -> Result<SuspendedProcess, LaunchError> {
        request.validate()?;

        log::debug!(
            "Launching {} suspended (cwd: {:?}, env entries: {})",
            request.executable().display(),
            request.working_directory(),
            request.environment().len()
        );

        let (pid, native) = spawn(request)?;

        log::info!(
            "Launched {} suspended as process {}",
            request.executable().display(),
            pid
        );

        Ok(SuspendedProcess {
            pid,
            native: Some(native),
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
type NativeHandle = platform::NativeHandle;

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
type NativeHandle = std::convert::Infallible;

#[cfg(any(target_os = "linux", target_os = "windows"))]
fn spawn(request: &LaunchRequest) -> Result<(ProcessId, NativeHandle), LaunchError> {
    platform::spawn_suspended(request)
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn spawn(_request: &LaunchRequest) -> Result<(ProcessId, NativeHandle), LaunchError> {
    Err(LaunchError::Unsupported)
}

/// A created-but-not-yet-running process, owned exclusively by whoever holds it.
///
/// Not `Clone`: only the holder may resume or kill it.
#[derive(Debug)]
pub struct SuspendedProcess {
    pid: ProcessId,
    native: Option<NativeHandle>,
}

impl SuspendedProcess {
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Let the primary thread start executing.
    pub fn resume(mut self) -> Result<ResumedProcess, ProcessError> {
        let pid = self.pid;
        match self.native.take() {
            Some(native) => {
                let native = resume_native(pid, native)?;
                log::info!("Resumed process {}", pid);
                Ok(ResumedProcess { pid, native })
            }
            None => Err(ProcessError::ResumeFailed {
                pid,
                reason: "handle already released".into(),
            }),
        }
    }

    /// Kill the process and reap it.
    pub fn terminate(mut self) -> Result<ProcessExit, ProcessError> {
        let pid = self.pid;
        match self.native.take() {
            Some(native) => {
                let exit = terminate_native(pid, native)?;
                log::info!("Terminated suspended process {} ({})", pid, exit);
                Ok(exit)
            }
            None => Err(ProcessError::TerminateFailed {
                pid,
                reason: "handle already released".into(),
            }),
        }
    }
}

impl Drop for SuspendedProcess {
    fn drop(&mut self) {
        if let Some(native) = self.native.take() {
            log::warn!(
                "Suspended process {} dropped without resume, terminating",
                self.pid
            );
            if let Err(e) = terminate_native(self.pid, native) {
                log::error!("{}", e);
            }
        }
    }
}

/// A released process. Reaping it is the caller's job unless a debugger owns it.
#[derive(Debug)]
pub struct ResumedProcess {
    pid: ProcessId,
    native: NativeHandle,
}

impl ResumedProcess {
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Block until the process ends. Only meaningful for untraced children.
    pub fn wait(self) -> Result<ProcessExit, ProcessError> {
        wait_native(self.pid, self.native)
    }
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
fn resume_native(pid: ProcessId, native: NativeHandle) -> Result<NativeHandle, ProcessError> {
    platform::resume(pid, native)
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
fn terminate_native(pid: ProcessId, native: NativeHandle) -> Result<ProcessExit, ProcessError> {
    platform::terminate(pid, native)
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
fn wait_native(pid: ProcessId, native: NativeHandle) -> Result<ProcessExit, ProcessError> {
    platform::wait(pid, native)
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn resume_native(_pid: ProcessId, native: NativeHandle) -> Result<NativeHandle, ProcessError> {
    match native {}
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn terminate_native(_pid: ProcessId, native: NativeHandle) -> Result<ProcessExit, ProcessError> {
    match native {}
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn wait_native(_pid: ProcessId, native: NativeHandle) -> Result<ProcessExit, ProcessError> {
    match native {}
}

#[cfg(test)]
mod tests;
