use anyhow::{Result, bail};
use clap::{Parser, Subcommand};

use crate::commands::batch::BatchArgs;
use crate::commands::clear::ClearArgs;
use crate::commands::disc::DiscArgs;
use crate::commands::{self, CommandReport};
use crate::logging;
use crate::tools::CancelToken;

#[derive(Parser, Debug)]
#[command(name = "disc-archiver", version)]
#[command(about = "Checksum-verified, parity-protected optical disc archiving", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Debug-level logging (DVD_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print the command report as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Image the inserted disc (default)
    Disc {
        /// Re-image a disc the ledger already holds
        #[arg(long)]
        force: bool,
    },

    /// Copy or convert numbered source folders into the batch target
    Batch {
        /// Do not ask before each item
        #[arg(short = 'y', long)]
        auto: bool,

        /// Convert mountable images to ISO instead of copying them
        #[arg(long)]
        convert: bool,

        /// Purge and redo every item numbered at or after N
        #[arg(long, value_name = "N")]
        start_from: Option<String>,
    },

    /// Summarize ledgers, statistics and items needing attention
    Status,

    /// Forget an item so the next run processes it again
    Clear {
        /// Item number (leading zeros optional)
        number: String,

        /// Also delete the item's output directories
        #[arg(long)]
        delete_output: bool,
    },
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "{}: {}",
        report.command,
        if report.ok { "ok" } else { "issues" }
    );
    for line in &report.details {
        println!("  {line}");
    }
    for line in &report.issues {
        println!("  ! {line}");
    }
    Ok(())
}

pub fn run(cancel: CancelToken) -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut report = match cli.command.unwrap_or(Commands::Disc { force: false }) {
        Commands::Disc { force } => commands::disc::run(&DiscArgs { force }, &cancel)?,
        Commands::Batch {
            auto,
            convert,
            start_from,
        } => commands::batch::run(
            &BatchArgs {
                auto,
                convert,
                start_from,
            },
            &cancel,
        )?,
        Commands::Status => commands::status::run()?,
        Commands::Clear {
            number,
            delete_output,
        } => commands::clear::run(&ClearArgs {
            number,
            delete_output,
        })?,
    };

    print_report(&report, cli.json)?;
    if let Some(err) = report.failure.take() {
        return Err(err.into());
    }
    if !report.ok {
        bail!("{} finished with issues", report.command);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_means_disc() {
        let cli = Cli::try_parse_from(["disc-archiver"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn batch_flags_parse() {
        let cli = Cli::try_parse_from(["disc-archiver", "batch", "-y", "--convert", "--start-from", "42"])
            .expect("parse");
        match cli.command {
            Some(Commands::Batch {
                auto,
                convert,
                start_from,
            }) => {
                assert!(auto && convert);
                assert_eq!(start_from.as_deref(), Some("42"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
