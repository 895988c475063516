use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use barrage::cli::{Cli, Commands, RunArgs};
use barrage::engine::control::{parse_control_command, ControlCommand, ControlState};
use barrage::engine::http_client::HttpClient;
use barrage::engine::memory::{format_bytes, preflight_check};
use barrage::engine::{build_runtime, pool_size_for, Engine};

fn init_logging(quiet: bool) {
    let default = if quiet { "barrage=warn" } else { "barrage=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn spawn_control_input() -> crossbeam_channel::Receiver<ControlCommand> {
    let (tx, rx) = crossbeam_channel::unbounded::<ControlCommand>();

    eprintln!("Interactive mode enabled. Commands: pause, resume, status, stop");
    eprintln!("   Type commands and press Enter.\n");

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines().map_while(|line| line.ok()) {
            if let Some(cmd) = parse_control_command(&line) {
                if tx.send(cmd).is_err() {
                    break; // Run finished
                }
            } else if !line.trim().is_empty() {
                eprintln!("Unknown command: {}", line.trim());
            }
        }
    });
    rx
}

fn run(args: RunArgs) -> Result<i32> {
    let plan = args.load_config()?.into_plan()?;
    let peak = plan.timeline.peak_target();

    if !args.no_memory_check {
        let preflight = preflight_check(peak);
        if !preflight.safe {
            eprintln!("╭────────────────────────────────────────────────────────────╮");
            eprintln!("│ ⚠️  MEMORY WARNING                                          │");
            eprintln!("├────────────────────────────────────────────────────────────┤");
            eprintln!("│ Peak VUs:          {:>8}                                │", preflight.requested);
            eprintln!("│ Estimated max:     {:>8} (based on available RAM)       │", preflight.estimated_max);
            eprintln!("│ Available RAM:     {:>8}                                │", format_bytes(preflight.available_bytes));
            eprintln!("│ Estimated needed:  {:>8}                                │", format_bytes(preflight.estimated_needed));
            eprintln!("│ Memory in use:     {:>7.1}%                                │", preflight.usage_percent * 100.0);
            eprintln!("├────────────────────────────────────────────────────────────┤");
            eprintln!("│ The test may run out of memory and crash.                  │");
            eprintln!("│ Use --no-memory-check to suppress this warning.            │");
            eprintln!("╰────────────────────────────────────────────────────────────╯");
            eprintln!();
        }
    }

    let commands = args.interactive.then(spawn_control_input);
    let control = Arc::new(ControlState::new());

    let runtime = build_runtime(peak)?;
    let outcome = runtime.block_on(async {
        let transport = Arc::new(HttpClient::with_pool_and_workers(pool_size_for(peak), peak));
        let engine = Engine::new(plan, transport);

        let ctrl_c = {
            let control = control.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping...");
                    control.stop();
                }
            })
        };

        let outcome = engine.run(control, commands).await;
        ctrl_c.abort();
        outcome
    });

    if args.json {
        println!("{}", outcome.to_json());
    } else {
        outcome.report();
    }
    if let Some(path) = &args.export_json {
        std::fs::write(path, outcome.to_json())?;
        info!("Summary written to {}", path.display());
    }

    Ok(outcome.exit_code())
}

fn write_schema(output: Option<PathBuf>) -> Result<i32> {
    let schema = schemars::schema_for!(barrage::cli::config::Config);
    let schema_json = serde_json::to_string_pretty(&schema)?;
    if let Some(out_path) = output {
        std::fs::write(&out_path, schema_json)?;
        println!("JSON Schema written to {:?}", out_path);
    } else {
        println!("{}", schema_json);
    }
    Ok(0)
}

fn main() {
    let cli = Cli::parse();
    let quiet = matches!(&cli.command, Commands::Run(args) if args.quiet || args.json);
    init_logging(quiet);

    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Validate { scenario } => {
            barrage::cli::validate::run_validate(&scenario).map(|_| 0)
        }
        Commands::Schema { output } => write_schema(output),
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "barrage", &mut std::io::stdout());
            Ok(0)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
