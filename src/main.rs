//! goal-runner — the autonomous goal-achievement control plane's CLI.
//!
//! This binary exists to make the control plane runnable end to end
//! from a terminal for manual exercising and smoke testing. It wires a
//! CLI, loads configuration, initializes telemetry, and hands control
//! to a `RetryController`; it is not itself part of the core's tested
//! contract.

mod adapters;
mod attempt;
mod config;
mod errors;
mod event_bus;
mod gateway;
mod loader;
mod plan;
mod retry;
mod state_hub;
mod supervision;
mod telemetry;
mod time_budget;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use adapters::demo::{DemoPlanner, DemoSupervisor, DemoVerifier, DemoWorker};
use config::RunnerConfig;
use errors::RunnerError;
use event_bus::EventBus;
use gateway::ConnectionGateway;
use retry::{AdapterSet, FinalReport, RetryConfig, RetryController};
use state_hub::{Confidence, RunStatus, StateHub};
use telemetry::TelemetryConfig;
use time_budget::parse_duration;

#[derive(Parser)]
#[command(name = "goal-runner", version, about = "Autonomous goal-achievement control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run to completion and print the FinalReport as JSON.
    Run(RunArgs),
    /// Same as `run`, but also serves a Connection Gateway for subscribers.
    Serve(ServeArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long)]
    goal: String,
    #[arg(long = "sub-goal")]
    sub_goals: Vec<String>,
    #[arg(long)]
    context_file: Option<PathBuf>,
    #[arg(long)]
    time_limit: Option<String>,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    working_dir: Option<PathBuf>,
}

#[derive(clap::Args)]
struct ServeArgs {
    #[arg(long)]
    bind: String,
    #[command(flatten)]
    run: RunArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let telemetry_config = TelemetryConfig::from_env();
    if let Err(e) = telemetry::init_telemetry(&telemetry_config) {
        eprintln!("warning: failed to initialize telemetry: {e}");
    }

    let exit_code = match cli.command {
        Commands::Run(args) => run_to_completion(args, None).await,
        Commands::Serve(args) => {
            let bind = args.bind.clone();
            run_to_completion(args.run, Some(bind)).await
        }
    };

    telemetry::shutdown_telemetry();
    ExitCode::from(exit_code as u8)
}

async fn run_to_completion(args: RunArgs, serve_bind: Option<String>) -> i32 {
    let mut config = RunnerConfig::from_env();
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(working_dir) = &args.working_dir {
        config.working_directory = Some(working_dir.clone());
    }
    if let Some(time_limit) = &args.time_limit {
        match parse_duration(time_limit) {
            Ok(d) => config.overall_time_limit = d,
            Err(e) => {
                eprintln!("invalid --time-limit: {e}");
                return 4;
            }
        }
    }

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("configuration problem: {problem}");
        }
        return 4;
    }

    let initial_context = match &args.context_file {
        Some(path) => match loader::load_initial_context(path) {
            Ok(content) => content,
            Err(e) => {
                eprintln!("failed to load context file: {e:#}");
                return 4;
            }
        },
        None => String::new(),
    };

    let session_id = Uuid::new_v4().to_string();
    let bus = Arc::new(EventBus::new(config.event_history_capacity, config.subscriber_queue_capacity));
    let state_hub = Arc::new(StateHub::new(
        bus.clone(),
        args.goal.clone(),
        args.sub_goals.clone(),
        initial_context.clone(),
        session_id.clone(),
        config.supervision_threshold,
    ));

    if let Some(bind) = serve_bind {
        let gateway = ConnectionGateway::new(bus.clone(), state_hub.clone(), config.event_history_capacity);
        tokio::spawn(async move {
            if let Err(e) = gateway.serve(&bind).await {
                tracing::error!(error = %e, "connection gateway stopped");
            }
        });
    }

    let adapters = AdapterSet {
        worker: Arc::new(DemoWorker),
        planner: Arc::new(DemoPlanner),
        verifier: Arc::new(DemoVerifier),
        supervisor: Arc::new(DemoSupervisor),
    };

    let controller = RetryController::new(
        RetryConfig {
            primary_goal: args.goal,
            sub_goals: args.sub_goals,
            initial_context,
            overall_time_limit: config.overall_time_limit,
            min_attempt_time: config.min_attempt_time,
            max_attempts: config.max_attempts,
            working_directory: config.working_directory,
            replan_every_n_iterations: config.replan_every_n_iterations,
            session_id,
        },
        adapters,
        state_hub,
        bus,
    );

    let report = controller.run().await;

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to serialize final report: {e}"),
    }

    exit_code_for(&report)
}

/// Exit codes: 0 on HIGH confidence + goal achieved; 1 on a final
/// verification that didn't pass or reach that bar; 2 on abort; 3 when
/// no attempt ever got a time allocation; 4 when an attempt errored
/// before producing a verification at all. Delegates to
/// `RunnerError::exit_code()` wherever the last attempt actually
/// carries one, rather than re-deriving the mapping here.
fn exit_code_for(report: &FinalReport) -> i32 {
    let Some(last) = &report.last_report else {
        return RunnerError::TimeExhausted.exit_code();
    };

    if let Some(error) = &last.error {
        return error.exit_code();
    }

    // A cooperative stop also leaves the run Aborted but carries no
    // RunnerError of its own.
    if last.status == RunStatus::Aborted {
        return 2;
    }

    match &last.final_verification {
        Some(v) if v.confidence == Confidence::High && v.goal_achieved => 0,
        Some(_) => 1,
        None => 4,
    }
}
