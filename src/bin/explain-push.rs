use clap::Parser;
use log::{error, info};
use pushjoin::{bin_utils, InterpretedCondPushdown, NoPushReason, PushConfig, PushEngine};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

/// Plans the pushed joins of query plan files and explains which tables could not be pushed.
#[derive(Parser)]
struct Args {
    /// Plan files with table definitions and ACCESS statements
    #[arg(required = true)]
    plans: Vec<PathBuf>,

    #[arg(short, long)]
    debug: bool,

    #[arg(long)]
    max_operations: Option<usize>,

    #[arg(long)]
    root_fragments: Option<usize>,

    #[arg(long)]
    no_outer_joined_scans: bool,

    #[arg(long)]
    disable: bool,

    /// Write the reasons for tables not being pushed as CSV
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    no_output: bool,
}

#[derive(Serialize)]
struct Record {
    plan: String,
    table: usize,
    alias: String,
    reason: String,
}

impl Args {
    fn config(&self) -> PushConfig {
        let defaults = PushConfig::default();
        defaults
            .clone()
            .set_enabled(!self.disable)
            .with_max_operations(self.max_operations.unwrap_or(defaults.max_operations))
            .with_root_fragments(self.root_fragments.unwrap_or(defaults.root_fragments))
            .set_outer_joined_scans(!self.no_outer_joined_scans)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = bin_utils::init_logging(args.debug) {
        eprintln!("Could not set up logging: {}", err);
    }

    let engine = PushEngine::with_config(args.config());
    let parser = pushjoin::Parser::new();
    let mut records = vec![];
    let mut failed = false;
    for path in &args.plans {
        let plan = match parser.parse_file(path) {
            Ok(plan) => plan,
            Err(err) => {
                error!("Could not parse {}: {}", path.display(), err);
                failed = true;
                continue;
            }
        };
        println!("{}", plan);

        let mut handlers = engine.make_handlers(&plan);
        let outcome = match engine.push_joins(&plan, &InterpretedCondPushdown, &mut handlers) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Could not push joins of {}: {}", path.display(), err);
                failed = true;
                continue;
            }
        };
        for join in &outcome.joins {
            println!("{}", join);
        }
        for handler in &handlers {
            if let Some(extra) = handler.explain_extra() {
                println!("{}: {}", handler.alias(), extra);
            }
        }
        for NoPushReason {
            table,
            alias,
            reason,
        } in outcome.explain
        {
            println!("Can't push table '{}' as child: {}", alias, reason);
            records.push(Record {
                plan: path.display().to_string(),
                table,
                alias,
                reason,
            });
        }
    }
    info!("{:?}", engine.stats());

    if !args.no_output {
        let output = args
            .output
            .unwrap_or_else(|| bin_utils::default_output_file("explain-push"));
        if let Err(err) = bin_utils::write_records(&output, records) {
            error!("Could not write {}: {}", output.display(), err);
            failed = true;
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
