//! incremat CLI: run and check incremental materialization programs.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};

use incremat::program::{Program, StepReport};
use incremat::reasoning::DeletionStrategy;

#[derive(Parser)]
#[command(name = "incremat", version, about = "Incremental Datalog materialization engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a program's facts, rules and update steps, printing the
    /// materialization after every round.
    Run {
        /// Path to the program TOML file.
        program: PathBuf,

        /// Output format.
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Override the deletion strategy of the program's `[engine]` table.
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Print only the last round.
        #[arg(long)]
        last: bool,
    },

    /// Report the stratification of a program's rules.
    Check {
        /// Path to the program TOML file.
        program: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Dred,
    Fbf,
}

impl From<StrategyArg> for DeletionStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Dred => DeletionStrategy::DRed,
            StrategyArg::Fbf => DeletionStrategy::Fbf,
        }
    }
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            program,
            format,
            strategy,
            last,
        } => {
            let program = Program::load(&program)?;
            let engine = program.engine(strategy.map(DeletionStrategy::from))?;
            let mut reports = program.run(&engine)?;
            if last && reports.len() > 1 {
                reports.drain(..reports.len() - 1);
            }
            match format {
                OutputFormat::Json => {
                    let json = serde_json::to_string_pretty(&reports).into_diagnostic()?;
                    println!("{json}");
                }
                OutputFormat::Text => {
                    for report in &reports {
                        print_report(report);
                    }
                }
            }
        }

        Commands::Check { program } => {
            let program = Program::load(&program)?;
            let engine = program.engine(None)?;
            for spec in &program.rules {
                engine.add_rule(spec)?;
            }
            let levels = engine.rule_levels()?;
            println!("Program is stratified ({} rules):", levels.len());
            for rule in &levels {
                let levels: Vec<String> = rule.levels.iter().map(usize::to_string).collect();
                println!("  {} (id {}): level {}", rule.name, rule.id, levels.join(", "));
            }
        }
    }

    Ok(())
}

fn print_report(report: &StepReport) {
    let summary = &report.summary;
    let strategy = summary
        .strategy
        .map_or_else(|| "-".to_string(), |s| s.to_string());
    println!(
        "== {} [{:?}, strategy {}, {} pass(es)]: -{} +{}",
        report.name, summary.maintenance, strategy, summary.passes, summary.deleted, summary.added
    );
    for [s, p, o] in &report.facts {
        println!("  {s} {p} {o}");
    }
}
