//! In-memory host that records every call it receives.
//!
//! No debugger is involved: attaching only checks the engine selectors and
//! logs the call, releasing resumes the process for real. Useful wherever the
//! attach/resume ordering has to be observed.

use std::collections::BTreeSet;

use super::{AttachError, DebugAttachRequest, DebugEngine, DebugHost, DebugSession, LaunchFlags};
use crate::launch::{ProcessError, ProcessId, ProcessStatus, ResumedProcess, SuspendedProcess};

/// One recorded host call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Attach {
        pid: u32,
        engines: Vec<DebugEngine>,
        flags: LaunchFlags,
        accepted: bool,
        /// Target state when the call arrived (Linux only)
        target: Option<ProcessStatus>,
    },
    Release {
        pid: u32,
        session: u64,
        /// Target state just before it was resumed (Linux only)
        target: Option<ProcessStatus>,
    },
}

#[derive(Debug, Clone)]
pub struct RecordingHost {
    supported: BTreeSet<DebugEngine>,
    refuse: Option<String>,
    calls: Vec<HostCall>,
    next_session: u64,
}

impl RecordingHost {
    /// Accepts the native and managed engines
    pub fn new() -> Self {
        Self::supporting([DebugEngine::Native, DebugEngine::Managed])
    }

    pub fn supporting<I: IntoIterator<Item = DebugEngine>>(engines: I) -> Self {
        Self {
            supported: engines.into_iter().collect(),
            refuse: None,
            calls: Vec::new(),
            next_session: 1,
        }
    }

    /// Every attach fails with `reason`
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            refuse: Some(reason.into()),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> &[HostCall] {
        &self.calls
    }

    pub fn released_any(&self) -> bool {
        self.calls
            .iter()
            .any(|call| matches!(call, HostCall::Release { .. }))
    }

    fn check(&self, request: &DebugAttachRequest) -> Result<ProcessId, AttachError> {
        let pid = ProcessId::new(request.target_pid).ok_or(AttachError::InvalidProcessId)?;

        if let Some(engine) = request
            .engines
            .iter()
            .find(|engine| !self.supported.contains(*engine))
        {
            return Err(AttachError::UnsupportedEngine {
                engine: engine.clone(),
                host: self.name().to_string(),
            });
        }

        if let Some(reason) = &self.refuse {
            return Err(AttachError::AttachFailed {
                pid: request.target_pid,
                reason: reason.clone(),
            });
        }

        Ok(pid)
    }
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugHost for RecordingHost {
    fn name(&self) -> &str {
        "recording"
    }

    fn attach_existing(
        &mut self,
        request: &DebugAttachRequest,
    ) -> Result<DebugSession, AttachError> {
        let outcome = self.check(request);

        self.calls.push(HostCall::Attach {
            pid: request.target_pid,
            engines: request.engines.iter().cloned().collect(),
            flags: request.flags,
            accepted: outcome.is_ok(),
            target: target_status(request.target_pid),
        });

        let pid = outcome?;
        let session = DebugSession {
            id: self.next_session,
            pid,
            engines: request.engines.clone(),
            flags: request.flags,
        };
        self.next_session += 1;
        Ok(session)
    }

    fn release(
        &mut self,
        session: &DebugSession,
        process: SuspendedProcess,
    ) -> Result<ResumedProcess, ProcessError> {
        self.calls.push(HostCall::Release {
            pid: process.pid().get(),
            session: session.id,
            target: target_status(process.pid().get()),
        });
        process.resume()
    }
}

#[cfg(target_os = "linux")]
fn target_status(pid: u32) -> Option<ProcessStatus> {
    ProcessId::new(pid).map(crate::launch::observe)
}

#[cfg(not(target_os = "linux"))]
fn target_status(_pid: u32) -> Option<ProcessStatus> {
    None
}
