//! Linux backend: fork, exec under `PTRACE_TRACEME`, park the new image in a stop.
//!
//! The child asks to be traced and calls `execve`. A successful exec traps with
//! `SIGTRAP` before the first instruction of the new image, which is also how the
//! parent learns that the image actually loaded. The parent then detaches with
//! `SIGSTOP`, so the process sits in a plain job-control stop (`T`) with the
//! image mapped: the state a debugger attaches to and `SIGCONT` releases.

use std::ffi::CString;
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use super::{LaunchError, LaunchRequest, ProcessError, ProcessExit, ProcessId, ProcessStatus};

/// Child exit status when `chdir` fails
const WORKDIR_FAILED: i32 = 125;
/// Child exit status when `PTRACE_TRACEME` is refused
const TRACEME_FAILED: i32 = 126;
/// Child exit status when `execve` fails
const EXEC_FAILED: i32 = 127;

/// The native handle on Linux is the child's pid; we are its parent.
#[derive(Debug)]
pub struct NativeHandle {
    pid: Pid,
}

/// Everything the child touches, built before `fork`.
struct ExecImage {
    program: CString,
    workdir: Option<CString>,
    // Backing storage for the pointer arrays below
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Option<Vec<*const c_char>>,
}

impl ExecImage {
    fn new(request: &LaunchRequest) -> Result<Self, LaunchError> {
        let program = c_string(request.executable().as_os_str().as_bytes())?;
        let argv = vec![program.clone()];
        let envp = if request.environment().is_inherited() {
            Vec::new()
        } else {
            request
                .environment()
                .to_assignments()
                .into_iter()
                .map(|assignment| c_string(assignment.as_bytes()))
                .collect::<Result<Vec<_>, _>>()?
        };
        let workdir = request
            .working_directory()
            .map(|dir| c_string(dir.as_os_str().as_bytes()))
            .transpose()?;

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = if request.environment().is_inherited() {
            None
        } else {
            Some(null_terminated(&envp))
        };

        Ok(Self {
            program,
            workdir,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
        })
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

pub(super) fn spawn_suspended(
    request: &LaunchRequest,
) -> Result<(ProcessId, NativeHandle), LaunchError> {
    let path = request.executable();
    let image = ExecImage::new(request)?;

    match unsafe { fork() } {
        Ok(ForkResult::Child) => exec_traced(&image),
        Ok(ForkResult::Parent { child }) => await_image(child, request),
        Err(errno) => Err(launch_error(errno, path)),
    }
}

/// Runs in the forked child. Only raw syscalls from here on. Never returns.
fn exec_traced(image: &ExecImage) -> ! {
    unsafe {
        if let Some(dir) = &image.workdir {
            if libc::chdir(dir.as_ptr()) != 0 {
                _exit(WORKDIR_FAILED);
            }
        }

        if ptrace::traceme().is_err() {
            _exit(TRACEME_FAILED);
        }

        match &image.envp_ptrs {
            Some(envp) => libc::execve(image.program.as_ptr(), image.argv_ptrs.as_ptr(), envp.as_ptr()),
            None => libc::execv(image.program.as_ptr(), image.argv_ptrs.as_ptr()),
        };

        _exit(EXEC_FAILED)
    }
}

fn _exit(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

/// Parent side: wait for the post-exec trap, then hand the image over to job control.
fn await_image(child: Pid, request: &LaunchRequest) -> Result<(ProcessId, NativeHandle), LaunchError> {
    let path = request.executable();
    loop {
        match wait_retrying(child, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => break,
            Ok(WaitStatus::Stopped(_, signal)) => {
                // Something other than the exec trap; let it through and keep waiting
                log::trace!("Process {} stopped by {:?} before exec", child, signal);
                if let Err(errno) = ptrace::cont(child, Some(signal)) {
                    kill_and_reap(child);
                    return Err(os_error(path, format!("PTRACE_CONT failed: {}", errno)));
                }
            }
            Ok(WaitStatus::Exited(_, code)) => return Err(child_failure(child, request, code)),
            Ok(status @ WaitStatus::Signaled(..)) => {
                return Err(LaunchError::EarlyExit {
                    pid: child.as_raw() as u32,
                    status: format!("{:?}", status),
                })
            }
            Ok(status) => log::trace!("Process {} before exec: {:?}", child, status),
            Err(errno) => {
                kill_and_reap(child);
                return Err(os_error(path, format!("waitpid({}) failed: {}", child, errno)));
            }
        }
    }

    // The stop is delivered before the tracee returns to user mode
    if let Err(errno) = ptrace::detach(child, Some(Signal::SIGSTOP)) {
        kill_and_reap(child);
        return Err(os_error(path, format!("PTRACE_DETACH failed: {}", errno)));
    }

    match wait_retrying(child, Some(WaitPidFlag::WUNTRACED)) {
        Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {}
        Ok(status) => {
            kill_and_reap(child);
            return Err(LaunchError::EarlyExit {
                pid: child.as_raw() as u32,
                status: format!("unexpected wait status {:?}", status),
            });
        }
        Err(errno) => {
            kill_and_reap(child);
            return Err(os_error(path, format!("waitpid({}) failed: {}", child, errno)));
        }
    }

    match process_id(child, path) {
        Ok(pid) => {
            log::debug!("Process {} stopped with its image loaded", pid);
            Ok((pid, NativeHandle { pid: child }))
        }
        Err(e) => {
            kill_and_reap(child);
            Err(e)
        }
    }
}

/// Map the child's setup exit status to what went wrong
fn child_failure(child: Pid, request: &LaunchRequest, code: i32) -> LaunchError {
    let path = request.executable();
    match (code, request.working_directory()) {
        (WORKDIR_FAILED, Some(dir)) => LaunchError::WorkingDirectory {
            path: dir.to_path_buf(),
        },
        (TRACEME_FAILED, _) => os_error(path, "PTRACE_TRACEME refused".into()),
        (EXEC_FAILED, _) => LaunchError::ExecFailed {
            path: path.to_path_buf(),
        },
        (code, _) => LaunchError::EarlyExit {
            pid: child.as_raw() as u32,
            status: format!("exit code {}", code),
        },
    }
}

fn os_error(path: &Path, reason: String) -> LaunchError {
    LaunchError::Os {
        path: path.to_path_buf(),
        reason,
    }
}

pub(super) fn resume(pid: ProcessId, native: NativeHandle) -> Result<NativeHandle, ProcessError> {
    match kill(native.pid, Signal::SIGCONT) {
        Ok(()) => Ok(native),
        Err(errno) => {
            kill_and_reap(native.pid);
            Err(ProcessError::ResumeFailed {
                pid,
                reason: errno.to_string(),
            })
        }
    }
}

pub(super) fn terminate(pid: ProcessId, native: NativeHandle) -> Result<ProcessExit, ProcessError> {
    match kill(native.pid, Signal::SIGKILL) {
        // Already dead but unreaped: waitpid below still collects it
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => {
            return Err(ProcessError::TerminateFailed {
                pid,
                reason: errno.to_string(),
            })
        }
    }

    reap(pid, native.pid).map_err(|reason| ProcessError::TerminateFailed { pid, reason })
}

pub(super) fn wait(pid: ProcessId, native: NativeHandle) -> Result<ProcessExit, ProcessError> {
    reap(pid, native.pid).map_err(|reason| ProcessError::WaitFailed { pid, reason })
}

/// Wait until the child is gone, skipping over stop/continue reports.
fn reap(pid: ProcessId, child: Pid) -> Result<ProcessExit, String> {
    loop {
        match wait_retrying(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ProcessExit::Code(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(ProcessExit::Signal(signal as i32)),
            Ok(status) => log::trace!("Process {}: {:?}", pid, status),
            Err(errno) => return Err(format!("waitpid failed: {}", errno)),
        }
    }
}

fn kill_and_reap(child: Pid) {
    let _ = kill(child, Signal::SIGKILL);
    let _ = wait_retrying(child, None);
}

fn wait_retrying(child: Pid, flags: Option<WaitPidFlag>) -> nix::Result<WaitStatus> {
    loop {
        match waitpid(child, flags) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Read the scheduler state of `pid` from `/proc/<pid>/stat`.
pub fn observe(pid: ProcessId) -> ProcessStatus {
    let stat = match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat,
        Err(_) => return ProcessStatus::Gone,
    };

    // The command name is parenthesised and may itself contain spaces or ')'
    let state = stat
        .rfind(')')
        .and_then(|end| stat[end + 1..].split_whitespace().next())
        .and_then(|field| field.chars().next());

    match state {
        Some('T') => ProcessStatus::Stopped,
        Some('t') => ProcessStatus::Traced,
        Some('Z') | Some('X') | Some('x') => ProcessStatus::Zombie,
        Some(_) => ProcessStatus::Running,
        None => ProcessStatus::Gone,
    }
}

fn process_id(pid: Pid, path: &Path) -> Result<ProcessId, LaunchError> {
    ProcessId::new(pid.as_raw() as u32).ok_or_else(|| LaunchError::Os {
        path: path.to_path_buf(),
        reason: "fork returned pid 0 to the parent".into(),
    })
}

fn c_string(bytes: &[u8]) -> Result<CString, LaunchError> {
    CString::new(bytes)
        .map_err(|_| LaunchError::InvalidArgument(String::from_utf8_lossy(bytes).into_owned()))
}

fn launch_error(errno: Errno, path: &Path) -> LaunchError {
    let path = path.to_path_buf();
    match errno {
        Errno::EAGAIN | Errno::ENOMEM => LaunchError::ResourceExhausted {
            path,
            reason: errno.to_string(),
        },
        Errno::EACCES | Errno::EPERM => LaunchError::PermissionDenied { path },
        Errno::ENOENT => LaunchError::NotFound { path },
        _ => LaunchError::Os {
            path,
            reason: errno.to_string(),
        },
    }
}
