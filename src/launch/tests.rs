//! Launcher tests
//!
//! The process-creating tests use stock binaries and only run on Linux.

use super::*;

#[test]
fn test_process_id_rejects_zero() {
    assert!(ProcessId::new(0).is_none());
    assert_eq!(ProcessId::new(42).map(ProcessId::get), Some(42));
}

#[test]
fn test_from_strings_treats_empty_as_inherit() {
    let request = LaunchRequest::from_strings("/bin/true", "", "").unwrap();
    assert_eq!(request.executable(), Path::new("/bin/true"));
    assert!(request.working_directory().is_none());
    assert!(request.environment().is_inherited());
}

#[test]
fn test_from_strings_rejects_bad_environment() {
    let result = LaunchRequest::from_strings("/bin/true", "", "NOT_AN_ASSIGNMENT");
    assert!(matches!(
        result,
        Err(LaunchError::MalformedEnvironment { .. })
    ));
}

#[test]
fn test_validate_empty_executable() {
    let request = LaunchRequest::new("");
    assert!(matches!(request.validate(), Err(LaunchError::EmptyExecutable)));
}

#[test]
fn test_validate_missing_executable() {
    let request = LaunchRequest::new("/nonexistent/stasis/missing.exe");
    assert!(matches!(request.validate(), Err(LaunchError::NotFound { .. })));
}

#[test]
fn test_validate_directory_is_not_executable() {
    let dir = tempfile::tempdir().unwrap();
    let request = LaunchRequest::new(dir.path());
    assert!(matches!(
        request.validate(),
        Err(LaunchError::NotExecutable { .. })
    ));
}

#[cfg(unix)]
#[test]
fn test_validate_non_executable_file() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let request = LaunchRequest::new(file.path());
    assert!(matches!(
        request.validate(),
        Err(LaunchError::NotExecutable { .. })
    ));
}

#[test]
fn test_process_exit_display() {
    assert_eq!(ProcessExit::Code(3).to_string(), "exit code 3");
    assert_eq!(ProcessExit::Signal(9).code(), None);
    assert!(ProcessExit::Code(0).success());
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    #[test]
    fn test_validate_missing_working_directory() {
        let request =
            LaunchRequest::new("/bin/true").with_working_directory("/nonexistent/stasis/dir");
        assert!(matches!(
            request.validate(),
            Err(LaunchError::WorkingDirectory { .. })
        ));
    }

    #[test]
    fn test_launch_leaves_process_stopped() {
        let process = SuspendedLauncher::new()
            .launch(&LaunchRequest::new("/bin/true"))
            .unwrap();

        assert_eq!(observe(process.pid()), ProcessStatus::Stopped);

        // Still stopped a moment later: nothing runs until resume
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(observe(process.pid()), ProcessStatus::Stopped);

        let exit = process.terminate().unwrap();
        assert_eq!(exit, ProcessExit::Signal(9));
    }

    #[test]
    fn test_resume_runs_target() {
        let process = SuspendedLauncher::new()
            .launch(&LaunchRequest::new("/bin/true"))
            .unwrap();

        let exit = process.resume().unwrap().wait().unwrap();
        assert_eq!(exit, ProcessExit::Code(0));
    }

    #[test]
    fn test_working_directory_applied_before_stop() {
        let dir = tempfile::tempdir().unwrap();
        let request = LaunchRequest::new("/bin/true").with_working_directory(dir.path());

        let process = SuspendedLauncher::new().launch(&request).unwrap();
        let cwd = std::fs::read_link(format!("/proc/{}/cwd", process.pid())).unwrap();
        assert_eq!(cwd, dir.path().canonicalize().unwrap());

        assert_eq!(
            process.resume().unwrap().wait().unwrap(),
            ProcessExit::Code(0)
        );
    }

    #[test]
    fn test_explicit_environment_launches() {
        let environment = EnvironmentBlock::from_pairs([("STASIS_MARK", "present")]).unwrap();
        let request = LaunchRequest::new("/bin/true").with_environment(environment);

        let exit = SuspendedLauncher::new()
            .launch(&request)
            .unwrap()
            .resume()
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(exit, ProcessExit::Code(0));
    }

    #[test]
    fn test_image_is_loaded_while_suspended() {
        let process = SuspendedLauncher::new()
            .launch(&LaunchRequest::new("/bin/true"))
            .unwrap();

        let image = std::fs::read_link(format!("/proc/{}/exe", process.pid())).unwrap();
        assert_eq!(image, Path::new("/bin/true").canonicalize().unwrap());
        assert_eq!(observe(process.pid()), ProcessStatus::Stopped);

        process.terminate().unwrap();
    }

    #[test]
    fn test_unloadable_image_fails_launch() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#!/nonexistent/stasis/interpreter\n").unwrap();
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))
            .unwrap();
        // Close our handle so the kernel does not see a writer at exec time
        let script = file.into_temp_path();

        let result = SuspendedLauncher::new().launch(&LaunchRequest::new(&*script));
        assert!(
            matches!(result, Err(LaunchError::ExecFailed { .. })),
            "unexpected result: {:?}",
            result
        );
    }

    #[test]
    fn test_execute_bit_for_other_users_only_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        if nix::unistd::geteuid().is_root() {
            println!("running as root, every execute bit counts; skipping");
            return;
        }

        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o601))
            .unwrap();

        let request = LaunchRequest::new(file.path());
        assert!(matches!(
            request.validate(),
            Err(LaunchError::NotExecutable { .. })
        ));
    }

    #[test]
    fn test_missing_executable_creates_nothing() {
        let result = SuspendedLauncher::new().launch(&LaunchRequest::new("/nonexistent/missing.exe"));
        assert!(matches!(result, Err(LaunchError::NotFound { .. })));
    }

    #[test]
    fn test_drop_terminates_suspended_process() {
        let process = SuspendedLauncher::new()
            .launch(&LaunchRequest::new("/bin/true"))
            .unwrap();
        let pid = process.pid();
        drop(process);

        // Killed and reaped by the drop
        assert_eq!(observe(pid), ProcessStatus::Gone);
    }
}
