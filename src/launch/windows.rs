//! Windows backend: `CreateProcessW` with `CREATE_SUSPENDED`.

use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::System::Threading::{
    CreateProcessW, GetExitCodeProcess, ResumeThread, TerminateProcess, WaitForSingleObject,
    CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, INFINITE, NORMAL_PRIORITY_CLASS,
    PROCESS_INFORMATION, STARTUPINFOW,
};

use super::{LaunchError, LaunchRequest, ProcessError, ProcessExit, ProcessId};

/// Exit code given to a process we kill before it ran
const TERMINATED_EXIT_CODE: u32 = 1;

/// Process and primary-thread handles from `CreateProcessW`. Closed on drop.
#[derive(Debug)]
pub struct NativeHandle {
    process: HANDLE,
    thread: HANDLE,
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.thread);
            let _ = CloseHandle(self.process);
        }
    }
}

pub(super) fn spawn_suspended(
    request: &LaunchRequest,
) -> Result<(ProcessId, NativeHandle), LaunchError> {
    let path = request.executable();

    let application = wide(path.as_os_str())?;
    // CreateProcessW may write into the command line buffer
    let mut command_line: Vec<u16> = std::iter::once('"' as u16)
        .chain(path.as_os_str().encode_wide())
        .chain(std::iter::once('"' as u16))
        .chain(std::iter::once(0))
        .collect();
    let workdir = request
        .working_directory()
        .map(|dir| wide(dir.as_os_str()))
        .transpose()?;
    let environment = if request.environment().is_inherited() {
        None
    } else {
        Some(request.environment().to_wide_block())
    };

    let startup = STARTUPINFOW {
        cb: std::mem::size_of::<STARTUPINFOW>() as u32,
        ..Default::default()
    };
    let mut info = PROCESS_INFORMATION::default();

    unsafe {
        CreateProcessW(
            PCWSTR(application.as_ptr()),
            PWSTR(command_line.as_mut_ptr()),
            None,
            None,
            false,
            NORMAL_PRIORITY_CLASS | CREATE_SUSPENDED | CREATE_UNICODE_ENVIRONMENT,
            environment
                .as_ref()
                .map(|block| block.as_ptr() as *const c_void),
            workdir
                .as_ref()
                .map(|dir| PCWSTR(dir.as_ptr()))
                .unwrap_or(PCWSTR::null()),
            &startup,
            &mut info,
        )
        .map_err(|e| launch_error(e, path))?;
    }

    let native = NativeHandle {
        process: info.hProcess,
        thread: info.hThread,
    };

    match ProcessId::new(info.dwProcessId) {
        Some(pid) => Ok((pid, native)),
        None => {
            unsafe {
                let _ = TerminateProcess(native.process, TERMINATED_EXIT_CODE);
            }
            Err(LaunchError::Os {
                path: path.to_path_buf(),
                reason: "CreateProcessW returned process id 0".into(),
            })
        }
    }
}

pub(super) fn resume(pid: ProcessId, native: NativeHandle) -> Result<NativeHandle, ProcessError> {
    let previous = unsafe { ResumeThread(native.thread) };
    if previous == u32::MAX {
        let reason = windows::core::Error::from_win32().to_string();
        unsafe {
            let _ = TerminateProcess(native.process, TERMINATED_EXIT_CODE);
        }
        return Err(ProcessError::ResumeFailed { pid, reason });
    }
    Ok(native)
}

pub(super) fn terminate(pid: ProcessId, native: NativeHandle) -> Result<ProcessExit, ProcessError> {
    unsafe {
        TerminateProcess(native.process, TERMINATED_EXIT_CODE).map_err(|e| {
            ProcessError::TerminateFailed {
                pid,
                reason: e.to_string(),
            }
        })?;
    }
    wait(pid, native).map_err(|e| ProcessError::TerminateFailed {
        pid,
        reason: e.to_string(),
    })
}

pub(super) fn wait(pid: ProcessId, native: NativeHandle) -> Result<ProcessExit, ProcessError> {
    let fail = |reason: String| ProcessError::WaitFailed { pid, reason };

    unsafe {
        if WaitForSingleObject(native.process, INFINITE) != WAIT_OBJECT_0 {
            return Err(fail(windows::core::Error::from_win32().to_string()));
        }
        let mut code = 0u32;
        GetExitCodeProcess(native.process, &mut code).map_err(|e| fail(e.to_string()))?;
        Ok(ProcessExit::Code(code as i32))
    }
}

fn wide(value: &std::ffi::OsStr) -> Result<Vec<u16>, LaunchError> {
    let mut buffer: Vec<u16> = value.encode_wide().collect();
    if buffer.contains(&0) {
        return Err(LaunchError::InvalidArgument(value.to_string_lossy().into_owned()));
    }
    buffer.push(0);
    Ok(buffer)
}

fn launch_error(error: windows::core::Error, path: &Path) -> LaunchError {
    use windows::Win32::Foundation::{
        ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_NOT_ENOUGH_MEMORY, ERROR_NO_SYSTEM_RESOURCES,
        ERROR_PATH_NOT_FOUND,
    };

    let path = path.to_path_buf();
    let code = error.code();
    if code == ERROR_FILE_NOT_FOUND.to_hresult() || code == ERROR_PATH_NOT_FOUND.to_hresult() {
        LaunchError::NotFound { path }
    } else if code == ERROR_ACCESS_DENIED.to_hresult() {
        LaunchError::PermissionDenied { path }
    } else if code == ERROR_NOT_ENOUGH_MEMORY.to_hresult()
        || code == ERROR_NO_SYSTEM_RESOURCES.to_hresult()
    {
        LaunchError::ResourceExhausted {
            path,
            reason: error.to_string(),
        }
    } else {
        LaunchError::Os {
            path,
            reason: error.to_string(),
        }
    }
}
