//! pimstore-dbmigrator - moves the PIM store to another database engine.
//!
//! Progress goes to stdout, errors to stderr. Questions are asked on the
//! terminal and answered with y, n or s. The process exits once the
//! migration reports completion.

mod cli;

use std::io::{BufRead, Write};

use clap::Parser;

use pimstore_core::config::ServerConfig;
use pimstore_migrator::{DbMigrator, MigrationEvent, Reporter, UiAnswer, UiDelegate};

use cli::CliArgs;

/// Asks questions on stdin.
struct TerminalUi;

impl TerminalUi {
    fn ask(&self, text: &str, choices: &str) -> Option<UiAnswer> {
        print!("{} {} ", text, choices);
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line).ok()? == 0 {
            return None;
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Some(UiAnswer::Yes),
            "n" | "no" => Some(UiAnswer::No),
            "s" | "skip" => Some(UiAnswer::Skip),
            _ => None,
        }
    }
}

impl UiDelegate for TerminalUi {
    fn question_yes_no(&mut self, text: &str) -> UiAnswer {
        loop {
            match self.ask(text, "[y/n]") {
                Some(UiAnswer::Skip) => continue,
                Some(answer) => return answer,
                None => return UiAnswer::No,
            }
        }
    }

    fn question_yes_no_skip(&mut self, text: &str) -> UiAnswer {
        self.ask(text, "[y/n/s]").unwrap_or(UiAnswer::No)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let paths = args.resolve_paths();
    let config = ServerConfig::load_or_default(&paths.server_config_file());

    // Tracing. Logs go to stderr so stdout only carries progress.
    let log_level = args.resolve_log_level(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();

    tracing::info!(
        target_engine = %args.new_engine,
        config = %paths.server_config_file().display(),
        data = %paths.data_dir().display(),
        "Starting pimstore-dbmigrator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let (reporter, mut events) = Reporter::channel();
    let worker = DbMigrator::new(args.new_engine.clone(), paths, reporter).start()?;

    let mut success = false;
    while let Some(event) = events.recv().await {
        match event {
            MigrationEvent::Info(text) => println!("{}", text),
            MigrationEvent::Error(text) => eprintln!("{}", text),
            MigrationEvent::Progress { table, done, total } => {
                println!("Migrating table {} ({}/{})...", table, done, total)
            }
            MigrationEvent::TableProgress { table, done, total } => {
                println!("  {}: {}/{} rows", table, done, total)
            }
            MigrationEvent::Completed(result) => {
                success = result;
                break;
            }
            question @ MigrationEvent::Question { .. } => {
                tokio::task::spawn_blocking(move || question.answer_with(&mut TerminalUi))
                    .await?;
            }
        }
    }

    if worker.join().is_err() {
        tracing::error!("Migration thread panicked");
        success = false;
    }

    if success {
        println!("Migration completed successfully.");
        Ok(())
    } else {
        eprintln!("Migration failed.");
        std::process::exit(1);
    }
}
