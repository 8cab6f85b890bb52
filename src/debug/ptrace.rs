//! Linux host debugger built on ptrace.
//!
//! Attach uses `PTRACE_SEIZE`, so the tracee is not sent an extra `SIGSTOP`.
//! A seized process that is already stopped re-traps into a `PTRACE_EVENT_STOP`,
//! which is what `attach_existing` waits for. From then on the tracee only
//! runs when this host continues it.
//!
//! The launcher has already run `execve` when the host attaches, so the exec
//! trap is gone; the host reports the loaded image as the first event of each
//! session instead, the way the Win32 host reports its create-process event.
//!
//! A traced process only makes progress while somebody pumps its events. The
//! host keeps every session reachable through [`SessionControl::sessions`] and
//! ends whatever is still open when it is dropped.
//!
//! ptrace requests must come from the thread that attached, so the host is
//! neither `Send` nor `Sync`.

use std::collections::HashMap;
use std::marker::PhantomData;

use nix::errno::Errno;
use nix::sys::ptrace::{self, Event, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use super::{
    AttachError, DebugAttachRequest, DebugEngine, DebugEvent, DebugHost, DebugSession,
    SessionControl,
};
use crate::launch::{ProcessError, ProcessExit, ProcessId, ResumedProcess, SuspendedProcess};

/// Per-session tracer state
#[derive(Debug)]
struct Tracee {
    pid: Pid,
    session: DebugSession,
    image_reported: bool,
}

/// ptrace-backed debugger
#[derive(Debug)]
pub struct PtraceHost {
    sessions: HashMap<u64, Tracee>,
    next_session: u64,
    _not_send: PhantomData<*const ()>,
}

impl PtraceHost {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            next_session: 1,
            _not_send: PhantomData,
        }
    }

    /// Number of sessions this host still owns
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn tracee(&self, session: &DebugSession) -> Result<&Tracee, AttachError> {
        self.sessions
            .get(&session.id)
            .ok_or(AttachError::UnknownSession { id: session.id })
    }

    /// Wait for the trap a seize of a stopped process produces.
    fn await_attach_stop(pid: Pid) -> Result<(), AttachError> {
        loop {
            match wait_retrying(pid) {
                Ok(WaitStatus::PtraceEvent(_, _, event)) if event == Event::PTRACE_EVENT_STOP as i32 => {
                    return Ok(())
                }
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    return Err(AttachError::AttachFailed {
                        pid: pid.as_raw() as u32,
                        reason: format!("process ended during attach: {:?}", status),
                    })
                }
                Ok(status) => log::trace!("Process {} during attach: {:?}", pid, status),
                Err(errno) => {
                    return Err(AttachError::AttachFailed {
                        pid: pid.as_raw() as u32,
                        reason: format!("waitpid failed: {}", errno),
                    })
                }
            }
        }
    }
}

impl Default for PtraceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugHost for PtraceHost {
    fn name(&self) -> &str {
        "ptrace"
    }

    fn attach_existing(
        &mut self,
        request: &DebugAttachRequest,
    ) -> Result<DebugSession, AttachError> {
        let pid_id = ProcessId::new(request.target_pid).ok_or(AttachError::InvalidProcessId)?;

        // ptrace only understands machine code; refuse the whole set up front
        if let Some(engine) = request
            .engines
            .iter()
            .find(|engine| **engine != DebugEngine::Native)
        {
            return Err(AttachError::UnsupportedEngine {
                engine: engine.clone(),
                host: self.name().to_string(),
            });
        }

        if tracer_of(pid_id).unwrap_or(0) != 0 {
            return Err(AttachError::AlreadyDebugged {
                pid: request.target_pid,
            });
        }

        let pid = Pid::from_raw(request.target_pid as i32);
        let mut options = Options::PTRACE_O_TRACEEXEC;
        // The target dies with the debugger; an explicit stop may still detach
        if request.flags.stop_debugging_on_end {
            options |= Options::PTRACE_O_EXITKILL;
        }

        log::debug!("PTRACE_SEIZE {} with {:?}", pid, options);
        ptrace::seize(pid, options).map_err(|errno| attach_error(errno, request.target_pid))?;

        if let Err(e) = Self::await_attach_stop(pid) {
            let _ = ptrace::detach(pid, None);
            return Err(e);
        }

        let id = self.next_session;
        self.next_session += 1;
        let session = DebugSession {
            id,
            pid: pid_id,
            engines: request.engines.clone(),
            flags: request.flags,
        };
        self.sessions.insert(
            id,
            Tracee {
                pid,
                session: session.clone(),
                image_reported: false,
            },
        );

        Ok(session)
    }

    fn release(
        &mut self,
        session: &DebugSession,
        process: SuspendedProcess,
    ) -> Result<ResumedProcess, ProcessError> {
        let pid = match self.tracee(session) {
            Ok(tracee) => tracee.pid,
            Err(e) => {
                return Err(ProcessError::ResumeFailed {
                    pid: process.pid(),
                    reason: e.to_string(),
                })
            }
        };

        // SIGCONT clears the job-control stop; the continue lets the tracee act on it
        let resumed = match process.resume() {
            Ok(resumed) => resumed,
            Err(e) => {
                // The backend already killed and reaped it
                self.sessions.remove(&session.id);
                return Err(e);
            }
        };
        if let Err(errno) = ptrace::cont(pid, None) {
            self.sessions.remove(&session.id);
            let _ = kill(pid, Signal::SIGKILL);
            let _ = resumed.wait();
            return Err(ProcessError::ResumeFailed {
                pid: session.pid,
                reason: format!("PTRACE_CONT failed: {}", errno),
            });
        }

        Ok(resumed)
    }
}

impl SessionControl for PtraceHost {
    fn wait_for_exit(
        &mut self,
        session: &DebugSession,
        on_event: &mut dyn FnMut(&DebugEvent),
    ) -> Result<ProcessExit, AttachError> {
        let tracee = self
            .sessions
            .get_mut(&session.id)
            .ok_or(AttachError::UnknownSession { id: session.id })?;
        let pid = tracee.pid;
        let raw = pid.as_raw() as u32;

        if !tracee.image_reported {
            tracee.image_reported = true;
            on_event(&DebugEvent::ImageLoaded { pid: raw });
        }

        loop {
            let status = wait_retrying(pid)
                .map_err(|errno| AttachError::EventError(format!("waitpid({}): {}", pid, errno)))?;

            let (event, resume_signal) = match status {
                WaitStatus::Exited(_, code) => {
                    let exit = ProcessExit::Code(code);
                    on_event(&DebugEvent::ProcessExited { exit });
                    self.sessions.remove(&session.id);
                    return Ok(exit);
                }
                WaitStatus::Signaled(_, signal, _) => {
                    let exit = ProcessExit::Signal(signal as i32);
                    on_event(&DebugEvent::ProcessExited { exit });
                    self.sessions.remove(&session.id);
                    return Ok(exit);
                }
                WaitStatus::PtraceEvent(_, _, event) if event == Event::PTRACE_EVENT_EXEC as i32 => {
                    (Some(DebugEvent::ImageLoaded { pid: raw }), None)
                }
                WaitStatus::PtraceEvent(_, _, event) if event == Event::PTRACE_EVENT_STOP as i32 => {
                    // Group stop or notification trap: keep the debuggee running
                    (Some(DebugEvent::GroupStop { pid: raw }), None)
                }
                WaitStatus::Stopped(_, signal) => (
                    Some(DebugEvent::Signal {
                        pid: raw,
                        signal: signal as i32,
                    }),
                    Some(signal),
                ),
                other => {
                    log::trace!("Process {}: {:?}", pid, other);
                    (None, None)
                }
            };

            if let Some(event) = event {
                log::debug!("Session {}: {}", session.id, event);
                on_event(&event);
            }

            match ptrace::cont(pid, resume_signal) {
                Ok(()) => {}
                // Killed between the report and the continue; the exit comes next
                Err(Errno::ESRCH) => {}
                Err(errno) => {
                    return Err(AttachError::EventError(format!(
                        "PTRACE_CONT {}: {}",
                        pid, errno
                    )))
                }
            }
        }
    }

    fn sessions(&self) -> Vec<DebugSession> {
        let mut sessions: Vec<_> = self
            .sessions
            .values()
            .map(|tracee| tracee.session.clone())
            .collect();
        sessions.sort_by_key(|session| session.id);
        sessions
    }

    fn stop(&mut self, session: &DebugSession) -> Result<(), AttachError> {
        let tracee = self
            .sessions
            .remove(&session.id)
            .ok_or(AttachError::UnknownSession { id: session.id })?;
        let pid = tracee.pid;

        if !tracee.session.flags.detach_on_stop {
            log::info!("Stopping session {}: killing process {}", session.id, pid);
            return match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(errno) => Err(AttachError::EventError(format!("kill {}: {}", pid, errno))),
            };
        }

        log::info!("Stopping session {}: detaching from process {}", session.id, pid);
        match ptrace::interrupt(pid) {
            Ok(()) => {}
            // Exited while nobody was pumping; nothing left to detach from
            Err(Errno::ESRCH) => return Ok(()),
            Err(errno) => {
                return Err(AttachError::EventError(format!(
                    "PTRACE_INTERRUPT {}: {}",
                    pid, errno
                )))
            }
        }

        // Detach needs the tracee in a ptrace stop
        let pending = loop {
            match wait_retrying(pid) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return Ok(()),
                Ok(WaitStatus::PtraceEvent(..)) => break None,
                // A signal on its way in; hand it over with the detach
                Ok(WaitStatus::Stopped(_, signal)) if signal != Signal::SIGTRAP => break Some(signal),
                Ok(WaitStatus::Stopped(..)) => break None,
                Ok(_) => continue,
                Err(errno) => {
                    return Err(AttachError::EventError(format!("waitpid({}): {}", pid, errno)))
                }
            }
        };

        ptrace::detach(pid, pending)
            .map_err(|errno| AttachError::EventError(format!("PTRACE_DETACH {}: {}", pid, errno)))
    }
}

impl Drop for PtraceHost {
    fn drop(&mut self) {
        for session in self.sessions() {
            log::warn!(
                "Session {} still open at shutdown, ending it (process {})",
                session.id,
                session.pid
            );
            if let Err(e) = self.stop(&session) {
                log::error!("{}", e);
            }
        }
    }
}

fn wait_retrying(pid: Pid) -> nix::Result<WaitStatus> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// `TracerPid` from `/proc/<pid>/status`
fn tracer_of(pid: ProcessId) -> Option<u32> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

fn attach_error(errno: Errno, pid: u32) -> AttachError {
    match errno {
        Errno::ESRCH => AttachError::ProcessNotFound { pid },
        Errno::EPERM | Errno::EACCES => AttachError::PermissionDenied {
            pid,
            reason: errno.to_string(),
        },
        _ => AttachError::AttachFailed {
            pid,
            reason: errno.to_string(),
        },
    }
}
