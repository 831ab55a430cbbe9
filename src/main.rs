//! forkpool - process-based worker pool demo driver.

use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Parser;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::{Value, json};

use forkpool::cli::{Cli, Commands, RunArgs};
use forkpool::logging;
use forkpool::pool::{CallbackRegistry, Pool, PoolConfig, RunnableFn, RunnableRegistry, Task};

/// How long `run` waits for an idle worker before giving up on a dispatch.
const DISPATCH_DEADLINE: Duration = Duration::from_secs(30);

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_config());

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Fork the pool, dispatch the requested jobs, drain notifications, stop.
fn cmd_run(args: &RunArgs) -> Result<()> {
    let tasks: Vec<Task> = args.parsed_jobs()?.into_iter().map(Task::new).collect();

    let mut pool = Pool::new(
        PoolConfig { size: args.workers },
        demo_runnables(),
        demo_callbacks(),
    )?;
    pool.start()?;

    for task in tasks {
        tracing::debug!(task_id = %task.id(), job = task.job().name(), "queueing task");
        let job = task.into_job();
        let deadline = Instant::now() + DISPATCH_DEADLINE;
        loop {
            if pool.dispatch(job.clone()) {
                break;
            }
            if Instant::now() >= deadline {
                bail!("no worker became idle within {:?}", DISPATCH_DEADLINE);
            }
            pool.dispatch_signals(Duration::from_millis(100))?;
        }
    }

    pool.run_for(Duration::from_secs(args.linger))?;

    // Closing the channels does not end the worker processes; follow up
    // with the termination signal the way the pool's own signal handler
    // would.
    let pids: Vec<Pid> = pool.registry().iter().map(|worker| worker.pid()).collect();
    pool.stop();
    for pid in pids {
        let _ = kill(pid, Signal::SIGTERM);
    }
    Ok(())
}

/// The job set workers know how to run.
///
/// Registered before the pool forks so every child image inherits it.
fn demo_runnables() -> RunnableRegistry {
    let mut registry = RunnableRegistry::new();

    registry.register(
        "greet",
        RunnableFn::arc(|worker, params| {
            let who = params
                .get("who")
                .and_then(Value::as_str)
                .unwrap_or("world")
                .to_string();
            worker.log(format!("greetings, {who}"));
            worker.callback("job-done", vec![json!("greet")]);
            Ok(())
        }),
    );

    registry.register(
        "sleep",
        RunnableFn::arc(|worker, params| {
            let secs = params.get("secs").and_then(Value::as_u64).unwrap_or(1);
            for _ in 0..secs {
                worker.keepalive();
                std::thread::sleep(Duration::from_secs(1));
            }
            worker.log(format!("done sleeping {secs}s"));
            worker.callback("job-done", vec![json!("sleep")]);
            Ok(())
        }),
    );

    registry.register(
        "crash",
        RunnableFn::arc(|worker, _| {
            worker.log("crashing on request");
            std::process::abort();
        }),
    );

    registry
}

/// Parent-side operations workers may request by name.
fn demo_callbacks() -> CallbackRegistry {
    let mut callbacks = CallbackRegistry::new();
    callbacks.register("job-done", |params| {
        tracing::info!(?params, "job finished");
    });
    callbacks
}
