//! Plan-driven execution loop for a code-generation agent.
//!
//! Reads the plan from markdown documents, runs one task at a time through
//! the configured agent, and keeps execution state under `.taskloop/`.

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use taskloop::control::{
    RollbackOutcome, abort_execution, pause_execution, retry_task, skip_task,
};
use taskloop::core::calculator::progress;
use taskloop::engine::Engine;
use taskloop::exit_codes;
use taskloop::io::init::{InitOptions, init_taskloop};
use taskloop::io::store::Execution;
use taskloop::logging;
use taskloop::looping::{LoopOptions, LoopOutcome, LoopStop};
use taskloop::phase::{current_phase, fire};
use taskloop::recover::{find_stale, resume_stale};
use taskloop::select::{SelectOutcome, plan_from_root, select_from_root};
use taskloop::start::start_execution;
use taskloop::validate::validate_project;

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Plan-driven execution loop for a code-generation agent"
)]
struct Cli {
    /// Log at info level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.taskloop/` and placeholder plan documents.
    Init {
        /// Overwrite taskloop-owned files.
        #[arg(short, long)]
        force: bool,
    },
    /// Check config, state machines, and plan structure.
    Validate,
    /// Print the next selectable task.
    Next,
    /// Print plan completion.
    Progress,
    /// Start an execution for a version and run its loop in the foreground.
    Start {
        version_id: String,
        /// Exit when the execution pauses instead of waiting for the flag.
        #[arg(long)]
        detach_on_pause: bool,
    },
    /// Clear a pause and run a stale execution's loop in the foreground.
    Resume {
        execution_id: String,
        #[arg(long)]
        detach_on_pause: bool,
    },
    /// Pause a running execution.
    Pause { execution_id: String },
    /// Abort an execution and roll the working tree back to its start snapshot.
    Abort { execution_id: String },
    /// Reset a task to pending and clear the pause.
    Retry {
        execution_id: String,
        task_id: String,
    },
    /// Mark a task skipped and clear the pause.
    Skip {
        execution_id: String,
        task_id: String,
    },
    /// Show one execution with its attempts, or list all executions.
    Status { execution_id: Option<String> },
    /// List live executions with no loop running.
    Stale,
    /// Show or advance the development phase of a version.
    Phase {
        version_id: String,
        event: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(command: Command) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    match command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Validate => cmd_validate(&root),
        Command::Next => cmd_next(&root),
        Command::Progress => cmd_progress(&root),
        Command::Start {
            version_id,
            detach_on_pause,
        } => {
            let engine = Engine::open(&root)?;
            let execution = start_execution(&engine, &version_id)?;
            println!("{}", execution.id);
            let outcome = engine.run(&execution.id, &LoopOptions { detach_on_pause })?;
            Ok(report_loop(&execution.id, &outcome))
        }
        Command::Resume {
            execution_id,
            detach_on_pause,
        } => {
            let engine = Engine::open(&root)?;
            let outcome =
                resume_stale(&engine, &execution_id, &LoopOptions { detach_on_pause })?;
            Ok(report_loop(&execution_id, &outcome))
        }
        Command::Pause { execution_id } => {
            let engine = Engine::open(&root)?;
            let execution = pause_execution(&engine, &execution_id)?;
            println!("{}", summary_line(&execution));
            Ok(exit_codes::OK)
        }
        Command::Abort { execution_id } => {
            let engine = Engine::open(&root)?;
            let outcome = abort_execution(&engine, &execution_id)?;
            match outcome.rollback {
                RollbackOutcome::RolledBack { commit_ref } => {
                    println!("aborted; working tree restored to {commit_ref}");
                }
                RollbackOutcome::Failed { commit_ref, error } => {
                    println!("aborted");
                    eprintln!(
                        "warning: rollback to {commit_ref} failed, working tree may be partial: {error}"
                    );
                }
                RollbackOutcome::NoSnapshot => println!("aborted; no snapshot to restore"),
            }
            Ok(exit_codes::OK)
        }
        Command::Retry {
            execution_id,
            task_id,
        } => {
            let engine = Engine::open(&root)?;
            let previous = retry_task(&engine, &execution_id, &task_id)?;
            println!("{task_id}: {} -> pending", previous.as_str());
            println!("continue with `taskloop resume {execution_id}` if no loop is running");
            Ok(exit_codes::OK)
        }
        Command::Skip {
            execution_id,
            task_id,
        } => {
            let engine = Engine::open(&root)?;
            let previous = skip_task(&engine, &execution_id, &task_id)?;
            println!("{task_id}: {} -> skipped", previous.as_str());
            println!("continue with `taskloop resume {execution_id}` if no loop is running");
            Ok(exit_codes::OK)
        }
        Command::Status { execution_id } => cmd_status(&root, execution_id.as_deref()),
        Command::Stale => {
            let engine = Engine::open(&root)?;
            for execution in find_stale(&engine)? {
                println!("{}", summary_line(&execution));
            }
            Ok(exit_codes::OK)
        }
        Command::Phase { version_id, event } => {
            let engine = Engine::open(&root)?;
            let phase = match event {
                Some(event) => fire(&engine, &version_id, &event)?,
                None => current_phase(&engine, &version_id)?,
            };
            let events = engine.development_machine().available_events(&phase);
            println!("{phase}");
            if !events.is_empty() {
                println!("events: {}", events.join(", "));
            }
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_taskloop(root, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let outcome = validate_project(root)?;
    if outcome.is_valid() {
        println!(
            "ok: {} milestones, {} tasks",
            outcome.milestones, outcome.tasks
        );
        return Ok(exit_codes::OK);
    }
    for defect in &outcome.defects {
        println!("- {defect}");
    }
    Ok(exit_codes::INVALID)
}

fn cmd_next(root: &Path) -> Result<i32> {
    let (outcome, _) = select_from_root(root)?;
    Ok(match outcome {
        SelectOutcome::Ready {
            task_id,
            title,
            milestone_id,
        } => {
            println!("{task_id}\t{milestone_id}\t{title}");
            exit_codes::OK
        }
        SelectOutcome::Blocked { blocked_by } => {
            println!("blocked: {}", blocked_by.join(", "));
            exit_codes::BLOCKED
        }
        SelectOutcome::Complete => {
            println!("all tasks completed");
            exit_codes::COMPLETE
        }
        SelectOutcome::NoPending => {
            println!("no pending tasks");
            exit_codes::COMPLETE
        }
    })
}

fn cmd_progress(root: &Path) -> Result<i32> {
    let plan = plan_from_root(root)?;
    let summary = progress(&plan);
    println!(
        "{}/{} ({}%)",
        summary.completed, summary.total, summary.percent
    );
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path, execution_id: Option<&str>) -> Result<i32> {
    let engine = Engine::open(root)?;
    let Some(id) = execution_id else {
        for execution in engine.store().list_executions()? {
            println!("{}", summary_line(&execution));
        }
        return Ok(exit_codes::OK);
    };
    let execution = engine
        .store()
        .get_execution(id)?
        .with_context(|| format!("execution {id} not found"))?;
    let attempts = engine.store().list_attempts(id)?;
    let payload = serde_json::json!({ "execution": execution, "attempts": attempts });
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("serialize status")?
    );
    Ok(exit_codes::OK)
}

fn summary_line(execution: &Execution) -> String {
    format!(
        "{}\t{}\t{}{}\t{}/{}\t{}",
        execution.id,
        execution.version_id,
        execution.status.as_str(),
        if execution.is_paused { " (flagged)" } else { "" },
        execution.completed_tasks,
        execution.total_tasks,
        execution.current_task_id.as_deref().unwrap_or("-"),
    )
}

fn report_loop(execution_id: &str, outcome: &LoopOutcome) -> i32 {
    eprintln!(
        "{} task(s) completed, {} failed",
        outcome.tasks_completed, outcome.tasks_failed
    );
    match outcome.stop {
        LoopStop::Completed => exit_codes::OK,
        LoopStop::Detached => {
            eprintln!(
                "execution {execution_id} paused; fix, retry or skip, then `taskloop resume {execution_id}`"
            );
            exit_codes::PAUSED
        }
        LoopStop::Aborted | LoopStop::Failed | LoopStop::Missing => {
            eprintln!("execution {execution_id} stopped: {:?}", outcome.stop);
            exit_codes::INVALID
        }
    }
}
