//! Debug attacher - attach first, resume last.

use super::{AttachError, DebugAttachRequest, DebugHost, DebugSession};
use crate::launch::{ProcessError, ResumedProcess, SuspendedProcess};

/// A process running under a debug session
#[derive(Debug)]
pub struct Attached {
    pub session: DebugSession,
    pub process: ResumedProcess,
}

/// Why an attach did not end with a running, debugged process
#[derive(Debug)]
pub enum AttachFailure {
    /// Nothing attached. The process is handed back, still suspended.
    Rejected {
        error: AttachError,
        process: SuspendedProcess,
    },
    /// Attached, but the release failed and the process is gone.
    ReleaseFailed {
        session: DebugSession,
        error: ProcessError,
    },
}

impl AttachFailure {
    pub fn describe(&self) -> String {
        match self {
            AttachFailure::Rejected { error, .. } => error.to_string(),
            AttachFailure::ReleaseFailed { error, .. } => error.to_string(),
        }
    }
}

pub type AttachResult = Result<Attached, AttachFailure>;

/// Drives one attach-then-resume against an injected host
pub struct DebugAttacher<'h, H: DebugHost + ?Sized> {
    host: &'h mut H,
}

impl<'h, H: DebugHost + ?Sized> DebugAttacher<'h, H> {
    pub fn new(host: &'h mut H) -> Self {
        Self { host }
    }

    /// Attach `request`'s engines to `process`, then resume it.
    ///
    /// The process is resumed only once the host confirms the attach.
    pub fn attach(&mut self, process: SuspendedProcess, request: &DebugAttachRequest) -> AttachResult {
        if let Err(error) = Self::check(&process, request) {
            return Err(AttachFailure::Rejected { error, process });
        }

        log::info!(
            "Attaching {} host to process {} (engines: {})",
            self.host.name(),
            request.target_pid,
            request
                .engines
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let session = match self.host.attach_existing(request) {
            Ok(session) => session,
            Err(error) => {
                log::warn!("Attach to process {} failed: {}", request.target_pid, error);
                return Err(AttachFailure::Rejected { error, process });
            }
        };

        log::info!(
            "Attached session {} to process {}",
            session.id,
            session.pid
        );

        match self.host.release(&session, process) {
            Ok(process) => Ok(Attached { session, process }),
            Err(error) => Err(AttachFailure::ReleaseFailed { session, error }),
        }
    }

    /// Preconditions checked before the host sees anything
    fn check(process: &SuspendedProcess, request: &DebugAttachRequest) -> Result<(), AttachError> {
        if request.target_pid == 0 {
            return Err(AttachError::InvalidProcessId);
        }
        if request.target_pid != process.pid().get() {
            return Err(AttachError::ProcessMismatch {
                requested: request.target_pid,
                actual: process.pid().get(),
            });
        }
        if request.engines.is_empty() {
            return Err(AttachError::NoEngines);
        }
        Ok(())
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::debug::{DebugEngine, HostCall, RecordingHost};
    use crate::launch::{observe, LaunchRequest, ProcessExit, ProcessStatus, SuspendedLauncher};

    fn launch_true() -> (SuspendedProcess, LaunchRequest) {
        let request = LaunchRequest::new("/bin/true");
        let process = SuspendedLauncher::new().launch(&request).unwrap();
        (process, request)
    }

    #[test]
    fn test_zero_pid_fails_without_host_call() {
        let (process, _) = launch_true();
        let mut host = RecordingHost::new();

        let request = DebugAttachRequest::new(0, "/bin/true");
        let result = DebugAttacher::new(&mut host).attach(process, &request);

        match result {
            Err(AttachFailure::Rejected {
                error: AttachError::InvalidProcessId,
                process,
            }) => {
                assert_eq!(observe(process.pid()), ProcessStatus::Stopped);
                process.terminate().unwrap();
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_empty_engine_set_fails_without_host_call() {
        let (process, launch) = launch_true();
        let mut host = RecordingHost::new();

        let request = DebugAttachRequest::for_process(&process, &launch).with_engines([]);
        let result = DebugAttacher::new(&mut host).attach(process, &request);

        assert!(matches!(
            result,
            Err(AttachFailure::Rejected {
                error: AttachError::NoEngines,
                ..
            })
        ));
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_attach_then_release_order() {
        let (process, launch) = launch_true();
        let pid = process.pid().get();
        let mut host = RecordingHost::new();

        let request = DebugAttachRequest::for_process(&process, &launch);
        let attached = DebugAttacher::new(&mut host).attach(process, &request).unwrap();

        let calls = host.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(
            &calls[0],
            HostCall::Attach { pid: p, accepted: true, target: Some(ProcessStatus::Stopped), .. } if *p == pid
        ));
        assert!(matches!(
            &calls[1],
            HostCall::Release { pid: p, target: Some(ProcessStatus::Stopped), .. } if *p == pid
        ));

        assert_eq!(attached.process.wait().unwrap(), ProcessExit::Code(0));
    }

    #[test]
    fn test_unsupported_engine_keeps_process_suspended() {
        let (process, launch) = launch_true();
        let mut host = RecordingHost::new();

        let request = DebugAttachRequest::for_process(&process, &launch)
            .with_engines([DebugEngine::Native, DebugEngine::Custom("quantum".into())]);

        match DebugAttacher::new(&mut host).attach(process, &request) {
            Err(AttachFailure::Rejected {
                error: AttachError::UnsupportedEngine { engine, .. },
                process,
            }) => {
                assert_eq!(engine, DebugEngine::Custom("quantum".into()));
                assert_eq!(observe(process.pid()), ProcessStatus::Stopped);
                process.terminate().unwrap();
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // One atomic attach attempt, never a release
        assert_eq!(host.calls().len(), 1);
        assert!(!host.released_any());
    }
}
