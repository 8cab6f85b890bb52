//! Stasis - start a process suspended, attach a debugger, then let it run.
//!
//! A normally launched process may run past the point a debugger cares about
//! before the debugger gets to it. Stasis closes that window:
//!
//! 1. [`launch`] creates the target suspended, before any of its code runs
//! 2. [`debug`] attaches a host debugger to the existing process
//! 3. only then is the process resumed
//!
//! [`pipeline`] sequences the three steps and cleans up on every failure path.

pub mod debug;
pub mod launch;
pub mod pipeline;

pub use debug::{
    AttachError, DebugAttachRequest, DebugAttacher, DebugEngine, DebugEvent, DebugHost,
    DebugSession, LaunchFlags, RecordingHost, SessionControl,
};
pub use launch::{
    EnvironmentBlock, LaunchError, LaunchRequest, ProcessError, ProcessExit, ProcessId,
    ResumedProcess, SuspendedLauncher, SuspendedProcess,
};
pub use pipeline::{
    launch_and_attach, OrphanPolicy, Pipeline, PipelineConfig, PipelineError, PipelineReport,
    PipelineState,
};
