//! Windows host debugger using the Win32 Debug API.
//!
//! Debug events are delivered to the thread that called `DebugActiveProcess`,
//! so the host is neither `Send` nor `Sync`.

use std::collections::HashMap;
use std::marker::PhantomData;

use windows::Win32::Foundation::{CloseHandle, NTSTATUS};
use windows::Win32::System::Diagnostics::Debug::{
    ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, DebugSetProcessKillOnExit,
    WaitForDebugEvent, CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT,
    EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT,
    LOAD_DLL_DEBUG_EVENT,
};
use windows::Win32::System::Threading::{OpenProcess, TerminateProcess, INFINITE, PROCESS_TERMINATE};

use super::{
    AttachError, DebugAttachRequest, DebugEngine, DebugEvent, DebugHost, DebugSession,
    SessionControl,
};
use crate::launch::{ProcessExit, ProcessId};

const DBG_CONTINUE: NTSTATUS = NTSTATUS(0x00010002i32);
const DBG_EXCEPTION_NOT_HANDLED: NTSTATUS = NTSTATUS(0x80010001u32 as i32);
const EXCEPTION_BREAKPOINT_CODE: u32 = 0x80000003;
const EXCEPTION_SINGLE_STEP_CODE: u32 = 0x80000004;
const ERROR_ACCESS_DENIED_CODE: i32 = 5;

#[derive(Debug)]
struct Debuggee {
    pid: u32,
    session: DebugSession,
}

/// Win32 Debug API host
#[derive(Debug)]
pub struct WindowsHost {
    sessions: HashMap<u64, Debuggee>,
    next_session: u64,
    _not_send: PhantomData<*const ()>,
}

impl WindowsHost {
    /// Create a new Windows debugger host
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            next_session: 1,
            _not_send: PhantomData,
        }
    }

    fn debuggee(&self, session: &DebugSession) -> Result<&Debuggee, AttachError> {
        self.sessions
            .get(&session.id)
            .ok_or(AttachError::UnknownSession { id: session.id })
    }
}

impl Default for WindowsHost {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugHost for WindowsHost {
    fn name(&self) -> &str {
        "win32"
    }

    fn attach_existing(
        &mut self,
        request: &DebugAttachRequest,
    ) -> Result<DebugSession, AttachError> {
        let pid = ProcessId::new(request.target_pid).ok_or(AttachError::InvalidProcessId)?;

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

        unsafe {
            DebugActiveProcess(request.target_pid).map_err(|e| {
                if e.code().0 & 0xFFFF == ERROR_ACCESS_DENIED_CODE {
                    AttachError::PermissionDenied {
                        pid: request.target_pid,
                        reason: e.to_string(),
                    }
                } else {
                    AttachError::AttachFailed {
                        pid: request.target_pid,
                        reason: e.to_string(),
                    }
                }
            })?;

            // The target dies with the debugger; an explicit stop may still detach
            if let Err(e) = DebugSetProcessKillOnExit(request.flags.stop_debugging_on_end) {
                let _ = DebugActiveProcessStop(request.target_pid);
                return Err(AttachError::AttachFailed {
                    pid: request.target_pid,
                    reason: e.to_string(),
                });
            }
        }

        let id = self.next_session;
        self.next_session += 1;
        let session = DebugSession {
            id,
            pid,
            engines: request.engines.clone(),
            flags: request.flags,
        };
        self.sessions.insert(
            id,
            Debuggee {
                pid: request.target_pid,
                session: session.clone(),
            },
        );

        Ok(session)
    }
}

impl SessionControl for WindowsHost {
    fn wait_for_exit(
        &mut self,
        session: &DebugSession,
        on_event: &mut dyn FnMut(&DebugEvent),
    ) -> Result<ProcessExit, AttachError> {
        let target = self.debuggee(session)?.pid;
        let mut debug_event = DEBUG_EVENT::default();

        loop {
            unsafe { WaitForDebugEvent(&mut debug_event, INFINITE) }
                .map_err(|e| AttachError::EventError(e.to_string()))?;

            let code = debug_event.dwDebugEventCode;
            let proc_id = debug_event.dwProcessId;
            let thread_id = debug_event.dwThreadId;
            let mut continue_status = DBG_CONTINUE;

            let event = match code {
                EXCEPTION_DEBUG_EVENT => unsafe {
                    let info = debug_event.u.Exception;
                    let record = info.ExceptionRecord;
                    let code_raw = record.ExceptionCode.0 as u32;
                    if code_raw != EXCEPTION_BREAKPOINT_CODE && code_raw != EXCEPTION_SINGLE_STEP_CODE {
                        continue_status = DBG_EXCEPTION_NOT_HANDLED;
                    }
                    Some(DebugEvent::Exception {
                        code: code_raw,
                        address: record.ExceptionAddress as u64,
                        first_chance: info.dwFirstChance != 0,
                    })
                },
                CREATE_PROCESS_DEBUG_EVENT => unsafe {
                    let _ = CloseHandle(debug_event.u.CreateProcessInfo.hFile);
                    Some(DebugEvent::ImageLoaded { pid: proc_id })
                },
                EXIT_PROCESS_DEBUG_EVENT => {
                    let exit_code = unsafe { debug_event.u.ExitProcess.dwExitCode };
                    Some(DebugEvent::ProcessExited {
                        exit: ProcessExit::Code(exit_code as i32),
                    })
                }
                CREATE_THREAD_DEBUG_EVENT => Some(DebugEvent::ThreadCreated { thread_id }),
                EXIT_THREAD_DEBUG_EVENT => Some(DebugEvent::ThreadExited { thread_id }),
                LOAD_DLL_DEBUG_EVENT => unsafe {
                    let _ = CloseHandle(debug_event.u.LoadDll.hFile);
                    Some(DebugEvent::ModuleLoaded {
                        base_address: debug_event.u.LoadDll.lpBaseOfDll as u64,
                    })
                },
                _ => None,
            };

            if let Some(event) = &event {
                log::debug!("Session {}: {}", session.id, event);
                on_event(event);
            }

            unsafe {
                let _ = ContinueDebugEvent(proc_id, thread_id, continue_status);
            }

            if let (Some(DebugEvent::ProcessExited { exit }), true) = (event, proc_id == target) {
                self.sessions.remove(&session.id);
                return Ok(exit);
            }
        }
    }

    fn sessions(&self) -> Vec<DebugSession> {
        let mut sessions: Vec<_> = self
            .sessions
            .values()
            .map(|debuggee| debuggee.session.clone())
            .collect();
        sessions.sort_by_key(|session| session.id);
        sessions
    }

    fn stop(&mut self, session: &DebugSession) -> Result<(), AttachError> {
        let debuggee = self
            .sessions
            .remove(&session.id)
            .ok_or(AttachError::UnknownSession { id: session.id })?;

        unsafe {
            if debuggee.session.flags.detach_on_stop {
                log::info!("Stopping session {}: detaching from process {}", session.id, debuggee.pid);
                DebugActiveProcessStop(debuggee.pid)
                    .map_err(|e| AttachError::EventError(e.to_string()))
            } else {
                log::info!("Stopping session {}: killing process {}", session.id, debuggee.pid);
                let handle = OpenProcess(PROCESS_TERMINATE, false, debuggee.pid)
                    .map_err(|e| AttachError::EventError(e.to_string()))?;
                let result = TerminateProcess(handle, 1).map_err(|e| AttachError::EventError(e.to_string()));
                let _ = CloseHandle(handle);
                result
            }
        }
    }
}
