//! Common types for attaching a debugger to a launched process.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::launch::{LaunchRequest, ProcessExit, ProcessId, SuspendedProcess};

/// Debug engine selector
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DebugEngine {
    /// Machine code
    Native,
    /// Managed runtime bytecode
    Managed,
    /// Any other engine, by name
    Custom(String),
}

impl FromStr for DebugEngine {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "native" => DebugEngine::Native,
            "managed" => DebugEngine::Managed,
            _ => DebugEngine::Custom(s.trim().to_string()),
        })
    }
}

impl fmt::Display for DebugEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebugEngine::Native => write!(f, "native"),
            DebugEngine::Managed => write!(f, "managed"),
            DebugEngine::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// End-of-session behaviour. Both facets are honoured independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchFlags {
    /// Ending the debug session terminates the debuggee
    pub stop_debugging_on_end: bool,
    /// When debugging stops for any other reason, detach instead of killing
    pub detach_on_stop: bool,
}

impl LaunchFlags {
    pub const DEFAULT: Self = Self {
        stop_debugging_on_end: true,
        detach_on_stop: true,
    };
    pub const NONE: Self = Self {
        stop_debugging_on_end: false,
        detach_on_stop: false,
    };
}

impl Default for LaunchFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// What the host debugger needs to attach to an already-running target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugAttachRequest {
    /// Target process ID; `0` is rejected before any host call
    pub target_pid: u32,
    /// Image path, for symbol and engine selection
    pub executable: PathBuf,
    pub flags: LaunchFlags,
    /// Engines attached together in one call
    pub engines: BTreeSet<DebugEngine>,
}

impl DebugAttachRequest {
    /// Native engine, default flags
    pub fn new(target_pid: u32, executable: impl Into<PathBuf>) -> Self {
        Self {
            target_pid,
            executable: executable.into(),
            flags: LaunchFlags::DEFAULT,
            engines: BTreeSet::from([DebugEngine::Native]),
        }
    }

    /// Derive the request for a freshly launched process
    pub fn for_process(process: &SuspendedProcess, launch: &LaunchRequest) -> Self {
        Self::new(process.pid().get(), launch.executable())
    }

    pub fn with_flags(mut self, flags: LaunchFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_engines<I: IntoIterator<Item = DebugEngine>>(mut self, engines: I) -> Self {
        self.engines = engines.into_iter().collect();
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

/// A live session, owned by the host debugger. The core only hands it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSession {
    /// Host-assigned identifier
    pub id: u64,
    pub pid: ProcessId,
    pub engines: BTreeSet<DebugEngine>,
    pub flags: LaunchFlags,
}

/// Debug event pumped from a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    /// Target image mapped; no target instruction has run yet
    ImageLoaded { pid: u32 },
    /// Signal about to be delivered to the debuggee
    Signal { pid: u32, signal: i32 },
    /// Job-control stop reported by the debuggee
    GroupStop { pid: u32 },
    /// Thread created
    ThreadCreated { thread_id: u32 },
    /// Thread exited
    ThreadExited { thread_id: u32 },
    /// DLL/Library loaded
    ModuleLoaded { base_address: u64 },
    /// Exception occurred
    Exception {
        code: u32,
        address: u64,
        first_chance: bool,
    },
    /// Process exited
    ProcessExited { exit: ProcessExit },
}

impl fmt::Display for DebugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebugEvent::ImageLoaded { pid } => write!(f, "image loaded in process {}", pid),
            DebugEvent::Signal { pid, signal } => {
                write!(f, "process {} received signal {}", pid, signal)
            }
            DebugEvent::GroupStop { pid } => write!(f, "process {} stopped", pid),
            DebugEvent::ThreadCreated { thread_id } => write!(f, "thread {} created", thread_id),
            DebugEvent::ThreadExited { thread_id } => write!(f, "thread {} exited", thread_id),
            DebugEvent::ModuleLoaded { base_address } => {
                write!(f, "module loaded at 0x{:016x}", base_address)
            }
            DebugEvent::Exception {
                code,
                address,
                first_chance,
            } => write!(
                f,
                "exception 0x{:08x} at 0x{:016x}{}",
                code,
                address,
                if *first_chance { " (first chance)" } else { "" }
            ),
            DebugEvent::ProcessExited { exit } => write!(f, "process exited ({})", exit),
        }
    }
}
