// Operator tool: dump the decoded, merged event stream of a sorted recovery
// log directory. Useful when a recovery aborts with a corruption diagnostic.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use strata_tablet::sorted_log::LogReadContext;
use strata_tablet::{LogEvent, RecoveryLogsIterator, ResolvedSortedLog};

#[derive(Parser, Debug)]
#[command(name = "walctl", about = "Inspect sorted recovery logs")]
struct Args {
    /// Recovery log directory, or a single sorted log file.
    path: PathBuf,

    /// Only print events for this tablet id.
    #[arg(long)]
    tablet_id: Option<i32>,

    /// Skip the OPEN-first validation (diagnostic replay of partial logs).
    #[arg(long)]
    no_validate: bool,

    /// Print the rows of each mutation, not just counts.
    #[arg(long)]
    mutations: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    let log = if args.path.is_file() {
        let parent = args
            .path
            .parent()
            .context("sorted log file has no parent directory")?;
        ResolvedSortedLog::from_parts(parent, vec![args.path.clone()])
    } else {
        ResolvedSortedLog::resolve(&args.path)?
    };

    let ctx = LogReadContext::default();
    let iter = RecoveryLogsIterator::new([&log], None, !args.no_validate, &ctx)?;

    let mut entries = 0u64;
    let mut mutations = 0u64;
    for entry in iter {
        let (key, value) = entry?;
        if let Some(tablet_id) = args.tablet_id {
            if key.tablet_id != tablet_id {
                continue;
            }
        }
        entries += 1;
        mutations += value.mutations.len() as u64;
        match key.event {
            LogEvent::Mutation | LogEvent::ManyMutations => {
                println!("{key} mutations:{}", value.mutations.len());
                if args.mutations {
                    for mutation in &value.mutations {
                        println!(
                            "  row:{} updates:{}",
                            String::from_utf8_lossy(mutation.row()),
                            mutation.updates().len()
                        );
                    }
                }
            }
            _ => println!("{key}"),
        }
    }
    println!("{entries} entries, {mutations} mutations");
    Ok(())
}
