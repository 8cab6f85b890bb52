//! Debug module - hand a suspended process to a debugger, then release it.
//!
//! The debugger itself is an injected capability ([`DebugHost`]):
//! - [`PtraceHost`] on Linux (ptrace via nix)
//! - [`WindowsHost`] on Windows (Win32 Debug API)
//! - [`RecordingHost`] everywhere, an in-memory host that records call order

pub mod attacher;
pub mod recording;
pub mod types;

#[cfg(target_os = "linux")]
pub mod ptrace;

#[cfg(target_os = "windows")]
pub mod windows;

pub use attacher::{AttachFailure, AttachResult, Attached, DebugAttacher};
pub use recording::{HostCall, RecordingHost};
pub use types::{DebugAttachRequest, DebugEngine, DebugEvent, DebugSession, LaunchFlags};

#[cfg(target_os = "linux")]
pub use self::ptrace::PtraceHost;

#[cfg(target_os = "windows")]
pub use self::windows::WindowsHost;

/// The debugger that ships for the current platform
#[cfg(target_os = "linux")]
pub type NativeHost = PtraceHost;

#[cfg(target_os = "windows")]
pub type NativeHost = WindowsHost;

use thiserror::Error;

use crate::launch::{ProcessError, ProcessExit, ResumedProcess, SuspendedProcess};

/// Attach-stage errors
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Invalid target process id 0")]
    InvalidProcessId,

    #[error("Attach request names process {requested} but the handle is for {actual}")]
    ProcessMismatch { requested: u32, actual: u32 },

    #[error("No debug engine selected")]
    NoEngines,

    #[error("Debug engine '{engine}' is not supported by the {host} host")]
    UnsupportedEngine { engine: DebugEngine, host: String },

    #[error("Process {pid} is already being debugged")]
    AlreadyDebugged { pid: u32 },

    #[error("Permission denied attaching to process {pid}: {reason}")]
    PermissionDenied { pid: u32, reason: String },

    #[error("Process not found: {pid}")]
    ProcessNotFound { pid: u32 },

    #[error("Failed to attach to process {pid}: {reason}")]
    AttachFailed { pid: u32, reason: String },

    #[error("No debug session {id}")]
    UnknownSession { id: u64 },

    #[error("Debug event error: {0}")]
    EventError(String),
}

/// Host debugging subsystem.
///
/// `attach_existing` must treat the target as already running (never spawn it)
/// and register every requested engine in one step, or none of them.
pub trait DebugHost {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// Register a session against the existing process in `request`.
    fn attach_existing(&mut self, request: &DebugAttachRequest)
        -> Result<DebugSession, AttachError>;

    /// Let an attached process run. Only called after `attach_existing` succeeded.
    fn release(
        &mut self,
        session: &DebugSession,
        process: SuspendedProcess,
    ) -> Result<ResumedProcess, ProcessError> {
        log::debug!("Releasing process {} (session {})", session.pid, session.id);
        process.resume()
    }
}

/// Hosts that can drive a session after the hand-off
pub trait SessionControl: DebugHost {
    /// Pump debug events until the debuggee exits.
    fn wait_for_exit(
        &mut self,
        session: &DebugSession,
        on_event: &mut dyn FnMut(&DebugEvent),
    ) -> Result<ProcessExit, AttachError>;

    /// Sessions still open on this host, oldest first
    fn sessions(&self) -> Vec<DebugSession>;

    /// End the session, detaching or killing according to its flags.
    fn stop(&mut self, session: &DebugSession) -> Result<(), AttachError>;

    /// Pump every open session until its debuggee exits.
    ///
    /// For callers that only kept the pass/fail result of a launch.
    fn wait_all(
        &mut self,
        on_event: &mut dyn FnMut(&DebugSession, &DebugEvent),
    ) -> Result<Vec<(DebugSession, ProcessExit)>, AttachError> {
        let mut exits = Vec::new();
        for session in self.sessions() {
            let exit = self.wait_for_exit(&session, &mut |event| on_event(&session, event))?;
            exits.push((session, exit));
        }
        Ok(exits)
    }
}
