use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use ux_test::config::load_config;
use ux_test::runner::{Mode, RunOptions, resolve_routes, run};

#[derive(Parser)]
#[command(version, about)]
struct CLI {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Runs smoke, accessibility and flow tests against a project.
    Run {
        /// Project directory containing .ux-test.json.
        target: Option<PathBuf>,
        /// Runs every project found under the scan directories.
        #[arg(long, default_value_t = false, conflicts_with = "target")]
        all: bool,
        #[arg(long = "scan-dir")]
        scan_dirs: Vec<PathBuf>,
        #[arg(long, value_enum, default_value_t = Mode::All)]
        mode: Mode,
        /// Runs only the flow with this name.
        #[arg(long)]
        flow: Option<String>,
        #[arg(long, default_value_t = false)]
        headed: bool,
        #[arg(long, default_value_t = false)]
        no_a11y: bool,
        #[arg(long, default_value_t = false)]
        no_visual: bool,
        /// Replaces baselines with this run's screenshots.
        #[arg(long, default_value_t = false)]
        update_baselines: bool,
        #[arg(long, default_value_t = false)]
        no_sandbox: bool,
    },
    /// Lists the routes a run would test.
    Routes { target: Option<PathBuf> },
}

fn list_routes(target: Option<PathBuf>) -> Result<bool> {
    let dir = std::path::absolute(target.unwrap_or_else(|| PathBuf::from(".")))?;
    let Some(config) = load_config(&dir)? else {
        println!("⚠️  No .ux-test.json found in {}", dir.display());
        return Ok(false);
    };
    let (routes, skipped) = resolve_routes(&config);
    for route in routes {
        println!("{}", route);
    }
    for route in skipped {
        println!("{} (skipped)", route);
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_target(true)
        .init();
    let cli = CLI::parse();
    let outcome = match cli.command {
        Command::Run {
            target,
            all,
            scan_dirs,
            mode,
            flow,
            headed,
            no_a11y,
            no_visual,
            update_baselines,
            no_sandbox,
        } => {
            let options = RunOptions {
                target,
                all,
                scan_dirs,
                mode,
                flow,
                headed,
                no_a11y,
                no_visual,
                update_baselines,
                no_sandbox,
            };
            run(&options).await
        }
        Command::Routes { target } => list_routes(target),
    };
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("{:#}", error);
            ExitCode::from(2)
        }
    }
}
