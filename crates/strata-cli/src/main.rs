//! strata - converge the microservices platform
//!
//! Exit status: 0 when every node settled, 1 when some nodes failed or were
//! skipped, 2 on configuration or state errors.

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod workspace;

use commands::Outcome;
use workspace::Options;

fn cli() -> Command {
    Command::new("strata")
        .version(strata_core::VERSION)
        .about("Dependency-ordered provisioning of the microservices platform")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file (STRATA_* variables override it)"),
        )
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .global(true)
                .default_value(".strata")
                .value_parser(value_parser!(PathBuf))
                .help("Directory holding state records and the simulated cloud"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print plans, reports and outputs as JSON"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .arg(
            Arg::new("max-parallel")
                .long("max-parallel")
                .global(true)
                .default_value("8")
                .value_parser(value_parser!(u64).range(1..=1024))
                .help("Maximum number of nodes converging at once"),
        )
        .subcommand(Command::new("preview").about("Show the convergence plan without changing anything"))
        .subcommand(Command::new("apply").about("Converge the platform"))
        .subcommand(Command::new("destroy").about("Tear the platform down, dependents first"))
        .subcommand(Command::new("outputs").about("Show the stack exports"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn options(matches: &ArgMatches) -> Options {
    Options {
        config: matches.get_one::<PathBuf>("config").cloned(),
        state_dir: matches
            .get_one::<PathBuf>("state-dir")
            .cloned()
            .unwrap_or_else(|| PathBuf::from(".strata")),
        json: matches.get_flag("json"),
        max_parallel: matches
            .get_one::<u64>("max-parallel")
            .map_or(8, |n| *n as usize),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    let Some((name, sub)) = matches.subcommand() else {
        return ExitCode::from(2);
    };
    init_tracing(sub.get_flag("log-json"));

    match commands::run(name, options(sub)).await {
        Ok(Outcome::Success) => ExitCode::SUCCESS,
        Ok(Outcome::NodeFailures) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}
