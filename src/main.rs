//! Stasis - launch under a debugger without losing the first instruction
//!
//! Entry point that parses the command line, runs the launch/attach/resume
//! pipeline against the platform debugger and pumps its events.

use std::collections::BTreeSet;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use colored::Colorize;

use stasis::debug::{NativeHost, SessionControl};
use stasis::{
    DebugEngine, DebugEvent, EnvironmentBlock, LaunchFlags, LaunchRequest, OrphanPolicy, Pipeline,
    PipelineConfig, PipelineError,
};

/// What to do with the target when the debugger cannot attach
#[derive(Debug, Clone, Copy, ValueEnum)]
enum AttachFailurePolicy {
    /// Kill the suspended process
    Terminate,
    /// Let it run without a debugger
    Resume,
}

impl From<AttachFailurePolicy> for OrphanPolicy {
    fn from(policy: AttachFailurePolicy) -> Self {
        match policy {
            AttachFailurePolicy::Terminate => OrphanPolicy::Terminate,
            AttachFailurePolicy::Resume => OrphanPolicy::ResumeAndAbandon,
        }
    }
}

/// Stasis: start a program suspended and release it under a debugger
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target executable
    executable: String,

    /// Working directory for the target (default: inherit)
    #[arg(short = 'C', long, default_value = "")]
    workdir: String,

    /// Environment variable for the target, KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Raw environment block, newline or NUL separated
    #[arg(long, conflicts_with = "env")]
    env_block: Option<String>,

    /// Debug engine to attach (repeatable)
    #[arg(long = "engine", default_value = "native")]
    engines: Vec<String>,

    /// Keep the target alive when the debug session ends
    #[arg(long, default_value_t = false)]
    no_stop_on_end: bool,

    /// Kill instead of detaching when debugging stops
    #[arg(long, default_value_t = false)]
    no_detach_on_stop: bool,

    /// What to do with the target if the attach fails
    #[arg(long, value_enum, default_value_t = AttachFailurePolicy::Terminate)]
    on_attach_failure: AttachFailurePolicy,

    /// Return right after the target is resumed instead of pumping debug events
    #[arg(long, default_value_t = false)]
    no_wait: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn environment_block(&self) -> String {
        match &self.env_block {
            Some(block) => block.clone(),
            None => self.env.join("\n"),
        }
    }

    fn config(&self) -> PipelineConfig {
        let engines: BTreeSet<DebugEngine> = self
            .engines
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();

        PipelineConfig {
            engines,
            flags: LaunchFlags {
                stop_debugging_on_end: !self.no_stop_on_end,
                detach_on_stop: !self.no_detach_on_stop,
            },
            orphan_policy: self.on_attach_failure.into(),
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    // 1. Parse command line arguments
    let args = Args::parse();

    // 2. Initialize logger with verbosity level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    log::debug!("Arguments: {:?}", args);

    // 3. Resolve the launch request from the three strings
    let environment: EnvironmentBlock = args.environment_block().parse()?;
    let request = LaunchRequest::new(&args.executable)
        .with_working_directory(&args.workdir)
        .with_environment(environment);

    println!("[*] Stasis v{}", env!("CARGO_PKG_VERSION"));
    println!("[*] Launching {} suspended", args.executable.bold());

    // 4. Launch, attach, resume
    let mut host = NativeHost::new();
    let report = match Pipeline::new(args.config()).run(&mut host, &request) {
        Ok(report) => report,
        Err(e) => {
            report_failure(&e);
            return Ok(ExitCode::FAILURE);
        }
    };

    println!(
        "{} Process {} running under debug session {}",
        "[+]".green(),
        report.process.pid(),
        report.session.id
    );

    if args.no_wait {
        // Leaving with the session open would take the target down with us
        host.stop(&report.session)?;
        return Ok(ExitCode::SUCCESS);
    }

    // 5. Pump debug events until the target exits
    let exit = host.wait_for_exit(&report.session, &mut print_event)?;
    println!("{} Target finished: {}", "[*]".cyan(), exit);

    let code = exit.code().unwrap_or(1);
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

fn print_event(event: &DebugEvent) {
    let tag = match event {
        DebugEvent::ProcessExited { .. } => "[-]".yellow(),
        DebugEvent::Exception { .. } => "[!]".red(),
        _ => "[.]".dimmed(),
    };
    println!("{} {}", tag, event);
}

fn report_failure(error: &PipelineError) {
    eprintln!("{} {} failed: {}", "[!]".red().bold(), error.stage(), error);
    eprintln!(
        "    stages: {}",
        error
            .history()
            .iter()
            .map(|state| state.to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
}
