//! Pipeline - launch suspended, attach, resume, in that order, once.
//!
//! Work that has to happen while nothing runs yet (patching the image, setting
//! up a shared channel) goes into the prepare step of [`Pipeline::run_prepared`],
//! between launch and attach.
//!
//! ```text
//! Idle -> Launched -> Attached -> Resumed
//!   \         \
//!    +---------+-----> Failed
//! ```

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::debug::{
    AttachError, AttachFailure, DebugAttachRequest, DebugAttacher, DebugEngine, DebugHost,
    DebugSession, LaunchFlags,
};
use crate::launch::{
    LaunchError, LaunchRequest, ProcessError, ProcessExit, ProcessId, ResumedProcess,
    SuspendedLauncher, SuspendedProcess,
};

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    Launched,
    Attached,
    Resumed,
    Failed,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Launched) | (Launched, Attached) | (Attached, Resumed) | (Idle, Failed) | (Launched, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Resumed | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Launched => "launched",
            PipelineState::Attached => "attached",
            PipelineState::Resumed => "resumed",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to do with a process that launched but could not be attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanPolicy {
    /// Kill it and reap it
    #[default]
    Terminate,
    /// Resume it and leave it running without a debugger
    ResumeAndAbandon,
}

/// How the orphaned process was disposed of
#[derive(Debug)]
pub enum Cleanup {
    Terminated(ProcessExit),
    /// Running untraced; reaping it is up to the caller
    Abandoned(ResumedProcess),
    Failed(ProcessError),
}

impl fmt::Display for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cleanup::Terminated(exit) => write!(f, "terminated, {}", exit),
            Cleanup::Abandoned(process) => {
                write!(f, "process {} resumed without debugger", process.pid())
            }
            Cleanup::Failed(e) => write!(f, "cleanup failed: {}", e),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Engines attached together
    pub engines: BTreeSet<DebugEngine>,
    pub flags: LaunchFlags,
    pub orphan_policy: OrphanPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            engines: BTreeSet::from([DebugEngine::Native]),
            flags: LaunchFlags::DEFAULT,
            orphan_policy: OrphanPolicy::Terminate,
        }
    }
}

/// A successful run: the process is running under `session`
#[derive(Debug)]
pub struct PipelineReport {
    pub session: DebugSession,
    pub process: ResumedProcess,
    pub history: Vec<PipelineState>,
}

/// Pipeline errors. Any of them means overall failure.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Launch failed: {source}")]
    Launch {
        source: LaunchError,
        history: Vec<PipelineState>,
    },

    #[error("Preparing process {pid} failed: {reason} ({cleanup})")]
    Prepare {
        pid: ProcessId,
        reason: String,
        cleanup: Cleanup,
        history: Vec<PipelineState>,
    },

    #[error("Attach to process {pid} failed: {source} ({cleanup})")]
    Attach {
        pid: ProcessId,
        source: AttachError,
        cleanup: Cleanup,
        history: Vec<PipelineState>,
    },

    #[error("Process {pid} attached in session {} but not resumed: {source}", .session.id)]
    Resume {
        pid: ProcessId,
        session: DebugSession,
        source: ProcessError,
        history: Vec<PipelineState>,
    },
}

impl PipelineError {
    /// Name of the stage that failed
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Launch { .. } => "launch",
            PipelineError::Prepare { .. } => "prepare",
            PipelineError::Attach { .. } => "attach",
            PipelineError::Resume { .. } => "resume",
        }
    }

    pub fn history(&self) -> &[PipelineState] {
        match self {
            PipelineError::Launch { history, .. }
            | PipelineError::Prepare { history, .. }
            | PipelineError::Attach { history, .. }
            | PipelineError::Resume { history, .. } => history,
        }
    }
}

/// Single-shot orchestrator
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    launcher: SuspendedLauncher,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            launcher: SuspendedLauncher::new(),
            state: PipelineState::Idle,
            history: vec![PipelineState::Idle],
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Launch `request` suspended, attach `host`, then resume. Consumes the pipeline.
    pub fn run<H: DebugHost + ?Sized>(
        self,
        host: &mut H,
        request: &LaunchRequest,
    ) -> Result<PipelineReport, PipelineError> {
        self.run_prepared(host, request, |_| Ok(()))
    }

    /// Like [`Pipeline::run`], with `prepare` called on the suspended process
    /// before the debugger sees it. A failing `prepare` disposes of the process
    /// under the orphan policy and the host is never called.
    pub fn run_prepared<H, F>(
        mut self,
        host: &mut H,
        request: &LaunchRequest,
        prepare: F,
    ) -> Result<PipelineReport, PipelineError>
    where
        H: DebugHost + ?Sized,
        F: FnOnce(&SuspendedProcess) -> anyhow::Result<()>,
    {
        let process = match self.launcher.launch(request) {
            Ok(process) => process,
            Err(source) => {
                log::error!("Launch of {} failed: {}", request.executable().display(), source);
                self.advance(PipelineState::Failed);
                return Err(PipelineError::Launch {
                    source,
                    history: self.history,
                });
            }
        };
        self.advance(PipelineState::Launched);

        let pid = process.pid();
        if let Err(e) = prepare(&process) {
            self.advance(PipelineState::Failed);
            let reason = format!("{:#}", e);
            let cleanup = dispose(process, self.config.orphan_policy);
            log::error!("Preparing process {} failed: {} ({})", pid, reason, cleanup);
            return Err(PipelineError::Prepare {
                pid,
                reason,
                cleanup,
                history: self.history,
            });
        }

        let attach_request = DebugAttachRequest::for_process(&process, request)
            .with_flags(self.config.flags)
            .with_engines(self.config.engines.iter().cloned());

        match DebugAttacher::new(host).attach(process, &attach_request) {
            Ok(attached) => {
                self.advance(PipelineState::Attached);
                self.advance(PipelineState::Resumed);
                Ok(PipelineReport {
                    session: attached.session,
                    process: attached.process,
                    history: self.history,
                })
            }
            Err(AttachFailure::Rejected { error, process }) => {
                self.advance(PipelineState::Failed);
                let cleanup = dispose(process, self.config.orphan_policy);
                log::error!("Attach to process {} failed: {} ({})", pid, error, cleanup);
                Err(PipelineError::Attach {
                    pid,
                    source: error,
                    cleanup,
                    history: self.history,
                })
            }
            Err(AttachFailure::ReleaseFailed { session, error }) => {
                // Attach succeeded; only the resume call itself failed
                self.advance(PipelineState::Attached);
                log::error!("Process {} attached but not resumed: {}", pid, error);
                Err(PipelineError::Resume {
                    pid,
                    session,
                    source: error,
                    history: self.history,
                })
            }
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid pipeline transition {} -> {}",
            self.state,
            next
        );
        log::info!("Pipeline: {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
    }
}

/// Never leave an unattached process suspended.
pub fn dispose(process: SuspendedProcess, policy: OrphanPolicy) -> Cleanup {
    let pid = process.pid();
    match policy {
        OrphanPolicy::Terminate => {
            log::warn!("Terminating unattached process {}", pid);
            match process.terminate() {
                Ok(exit) => Cleanup::Terminated(exit),
                Err(e) => Cleanup::Failed(e),
            }
        }
        OrphanPolicy::ResumeAndAbandon => {
            log::warn!("Resuming unattached process {} without a debugger", pid);
            match process.resume() {
                Ok(process) => Cleanup::Abandoned(process),
                Err(e) => Cleanup::Failed(e),
            }
        }
    }
}

/// Launch, attach and resume; report only pass/fail. Details go to the log.
///
/// The session stays with `host`. A host that traces its debuggee (ptrace) must
/// still be pumped, e.g. with [`SessionControl::wait_all`](crate::debug::SessionControl::wait_all),
/// or the debuggee stalls at its next debug event.
pub fn launch_and_attach<H: DebugHost + ?Sized>(
    host: &mut H,
    request: &LaunchRequest,
    config: PipelineConfig,
) -> bool {
    match Pipeline::new(config).run(host, request) {
        Ok(report) => {
            log::info!(
                "Process {} running under session {}",
                report.process.pid(),
                report.session.id
            );
            true
        }
        Err(e) => {
            log::error!("{} stage failed: {}", e.stage(), e);
            false
        }
    }
}
