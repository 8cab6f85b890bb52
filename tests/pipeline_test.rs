//! Integration Tests for the launch/attach/resume pipeline
//!
//! Run with: cargo test --test pipeline_test -- --nocapture

#[cfg(target_os = "linux")]
mod tests {
    use stasis::debug::{AttachFailure, HostCall, PtraceHost};
    use stasis::launch::{observe, ProcessStatus};
    use stasis::pipeline::{dispose, Cleanup};
    use stasis::{
        launch_and_attach, AttachError, DebugAttachRequest, DebugAttacher, DebugEngine,
        DebugEvent, LaunchError, LaunchRequest, OrphanPolicy, Pipeline, PipelineConfig,
        LaunchFlags, PipelineError, PipelineReport, PipelineState, ProcessExit, RecordingHost,
        SessionControl,
        SuspendedLauncher,
    };

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config_with_engine(engine: DebugEngine, policy: OrphanPolicy) -> PipelineConfig {
        PipelineConfig {
            engines: [engine].into_iter().collect(),
            orphan_policy: policy,
            ..Default::default()
        }
    }

    /// Scenario A: inherit workdir and env, one engine, default flags
    #[test]
    fn test_full_pipeline_succeeds() {
        init_logging();
        let request = LaunchRequest::from_strings("/bin/true", "", "").unwrap();
        let mut host = RecordingHost::new();

        let report = Pipeline::new(PipelineConfig::default())
            .run(&mut host, &request)
            .unwrap();

        assert_eq!(
            report.history,
            vec![
                PipelineState::Idle,
                PipelineState::Launched,
                PipelineState::Attached,
                PipelineState::Resumed
            ]
        );
        assert_eq!(report.session.pid, report.process.pid());
        assert_eq!(report.process.wait().unwrap(), ProcessExit::Code(0));
    }

    /// Scenario B: the attacher is never reached
    #[test]
    fn test_missing_executable_never_attaches() {
        init_logging();
        let request = LaunchRequest::from_strings("missing.exe", "", "").unwrap();
        let mut host = RecordingHost::new();

        let err = Pipeline::new(PipelineConfig::default())
            .run(&mut host, &request)
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Launch {
                source: LaunchError::NotFound { .. },
                ..
            }
        ));
        assert_eq!(err.history(), &[PipelineState::Idle, PipelineState::Failed]);
        assert!(host.calls().is_empty());
        assert!(!launch_and_attach(&mut host, &request, PipelineConfig::default()));
    }

    /// Scenario C, step by step: suspended right after the failed attach
    #[test]
    fn test_failed_attach_hands_back_suspended_process() {
        init_logging();
        let request = LaunchRequest::new("/bin/true");
        let process = SuspendedLauncher::new().launch(&request).unwrap();
        let pid = process.pid();
        let mut host = RecordingHost::new();

        let attach = DebugAttachRequest::for_process(&process, &request)
            .with_engines([DebugEngine::Custom("unknown-engine".into())]);

        let process = match DebugAttacher::new(&mut host).attach(process, &attach) {
            Err(AttachFailure::Rejected {
                error: AttachError::UnsupportedEngine { .. },
                process,
            }) => process,
            other => panic!("unexpected result: {:?}", other),
        };

        assert_eq!(observe(pid), ProcessStatus::Stopped);

        match dispose(process, OrphanPolicy::Terminate) {
            Cleanup::Terminated(exit) => assert_eq!(exit, ProcessExit::Signal(9)),
            other => panic!("unexpected cleanup: {}", other),
        }
        assert_eq!(observe(pid), ProcessStatus::Gone);
    }

    /// Scenario C through the pipeline with the kill policy
    #[test]
    fn test_unsupported_engine_terminates_target() {
        init_logging();
        let request = LaunchRequest::new("/bin/true");
        let mut host = RecordingHost::new();
        let config = config_with_engine(DebugEngine::Custom("unknown-engine".into()), OrphanPolicy::Terminate);

        let err = Pipeline::new(config).run(&mut host, &request).unwrap_err();

        let pid = match &err {
            PipelineError::Attach {
                pid,
                source: AttachError::UnsupportedEngine { .. },
                cleanup: Cleanup::Terminated(ProcessExit::Signal(9)),
                ..
            } => *pid,
            other => panic!("unexpected error: {}", other),
        };
        assert_eq!(
            err.history(),
            &[PipelineState::Idle, PipelineState::Launched, PipelineState::Failed]
        );

        // Exactly one process was created and it is gone, never released
        assert_eq!(host.calls().len(), 1);
        assert!(!host.released_any());
        assert_eq!(observe(pid), ProcessStatus::Gone);
    }

    /// Scenario C through the pipeline with the resume-and-abandon policy
    #[test]
    fn test_refused_attach_resumes_target_when_asked() {
        init_logging();
        let request = LaunchRequest::new("/bin/true");
        let mut host = RecordingHost::refusing("engine busy");
        let config = config_with_engine(DebugEngine::Native, OrphanPolicy::ResumeAndAbandon);

        let err = Pipeline::new(config).run(&mut host, &request).unwrap_err();
        assert_eq!(err.stage(), "attach");

        match err {
            PipelineError::Attach {
                cleanup: Cleanup::Abandoned(process),
                ..
            } => {
                // Ran to completion without a debugger
                assert_eq!(process.wait().unwrap(), ProcessExit::Code(0));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!host.released_any());
    }

    /// Resume is never observed before the attach succeeded
    #[test]
    fn test_resume_follows_attach_across_runs() {
        init_logging();
        let request = LaunchRequest::new("/bin/true");

        for _ in 0..5 {
            let mut host = RecordingHost::new();
            let report = Pipeline::new(PipelineConfig::default())
                .run(&mut host, &request)
                .unwrap();

            match host.calls() {
                [HostCall::Attach {
                    accepted: true,
                    target: Some(ProcessStatus::Stopped),
                    ..
                }, HostCall::Release {
                    target: Some(ProcessStatus::Stopped),
                    ..
                }] => {}
                calls => panic!("unexpected call order: {:?}", calls),
            }

            report.process.wait().unwrap();
        }
    }

    #[test]
    fn test_multiple_engines_attach_in_one_call() {
        init_logging();
        let request = LaunchRequest::new("/bin/true");
        let mut host = RecordingHost::new();
        let config = PipelineConfig {
            engines: [DebugEngine::Native, DebugEngine::Managed].into_iter().collect(),
            ..Default::default()
        };

        let report = Pipeline::new(config).run(&mut host, &request).unwrap();

        let attaches: Vec<_> = host
            .calls()
            .iter()
            .filter_map(|call| match call {
                HostCall::Attach { engines, .. } => Some(engines.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(attaches, vec![vec![DebugEngine::Native, DebugEngine::Managed]]);
        assert_eq!(report.session.engines.len(), 2);

        report.process.wait().unwrap();
    }

    /// Real debugger: the loaded image is reported before anything else
    #[test]
    fn test_ptrace_session_sees_image_load() {
        init_logging();
        let request = LaunchRequest::new("/bin/true");
        let mut host = PtraceHost::new();

        let report = match Pipeline::new(PipelineConfig::default()).run(&mut host, &request) {
            Ok(report) => report,
            Err(PipelineError::Attach {
                source: AttachError::PermissionDenied { .. },
                ..
            }) => {
                println!("⚠️ ptrace not permitted (expected in restricted sandboxes)");
                return;
            }
            Err(e) => panic!("pipeline failed: {}", e),
        };

        let mut events = Vec::new();
        let exit = host
            .wait_for_exit(&report.session, &mut |event| events.push(event.clone()))
            .unwrap();

        assert_eq!(exit, ProcessExit::Code(0));
        let first_image = events
            .iter()
            .position(|event| matches!(event, DebugEvent::ImageLoaded { .. }));
        let exited = events
            .iter()
            .position(|event| matches!(event, DebugEvent::ProcessExited { .. }));
        assert_eq!(first_image, Some(0));
        assert!(first_image < exited);
    }

    /// Run the pipeline against a fresh ptrace host, `None` when tracing is forbidden here
    fn run_ptrace(config: PipelineConfig) -> Option<(PtraceHost, PipelineReport)> {
        let request = LaunchRequest::new("/bin/true");
        let mut host = PtraceHost::new();
        match Pipeline::new(config).run(&mut host, &request) {
            Ok(report) => Some((host, report)),
            Err(PipelineError::Attach {
                source: AttachError::PermissionDenied { .. },
                ..
            }) => {
                println!("⚠️ ptrace not permitted (expected in restricted sandboxes)");
                None
            }
            Err(e) => panic!("pipeline failed: {}", e),
        }
    }

    #[test]
    fn test_ptrace_stop_detaches_by_default() {
        init_logging();
        let Some((mut host, report)) = run_ptrace(PipelineConfig::default()) else {
            return;
        };

        host.stop(&report.session).unwrap();
        assert_eq!(host.session_count(), 0);
        assert_eq!(report.process.wait().unwrap(), ProcessExit::Code(0));
    }

    #[test]
    fn test_ptrace_stop_kills_without_detach_flag() {
        init_logging();
        let config = PipelineConfig {
            flags: LaunchFlags::NONE,
            ..Default::default()
        };
        let Some((mut host, report)) = run_ptrace(config) else {
            return;
        };

        host.stop(&report.session).unwrap();
        assert_eq!(report.process.wait().unwrap(), ProcessExit::Signal(9));
    }

    #[test]
    fn test_dropped_ptrace_host_lets_target_finish() {
        init_logging();
        let Some((host, report)) = run_ptrace(PipelineConfig::default()) else {
            return;
        };

        drop(host);
        assert_eq!(report.process.wait().unwrap(), ProcessExit::Code(0));
    }

    /// Boolean entry point on the real debugger: the session stays reachable and pumpable
    #[test]
    fn test_launch_and_attach_with_ptrace_host() {
        init_logging();
        // Find out whether tracing works here at all
        if run_ptrace(PipelineConfig::default()).is_none() {
            return;
        }

        let request = LaunchRequest::new("/bin/true");
        let mut host = PtraceHost::new();
        assert!(launch_and_attach(&mut host, &request, PipelineConfig::default()));

        let sessions = host.sessions();
        assert_eq!(sessions.len(), 1);

        let mut events = 0;
        let exits = host.wait_all(&mut |_, _| events += 1).unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].0.id, sessions[0].id);
        assert_eq!(exits[0].1, ProcessExit::Code(0));
        assert!(events >= 2);
        assert!(host.sessions().is_empty());
    }

    #[test]
    fn test_ptrace_rejects_managed_engine_and_cleans_up() {
        init_logging();
        let request = LaunchRequest::new("/bin/true");
        let mut host = PtraceHost::new();
        let config = config_with_engine(DebugEngine::Managed, OrphanPolicy::Terminate);

        let err = Pipeline::new(config).run(&mut host, &request).unwrap_err();
        match &err {
            PipelineError::Attach {
                pid,
                source: AttachError::UnsupportedEngine { .. },
                cleanup: Cleanup::Terminated(_),
                ..
            } => assert_eq!(observe(*pid), ProcessStatus::Gone),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(host.session_count(), 0);
    }
}
