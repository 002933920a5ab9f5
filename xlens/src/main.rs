//! Entrypoint of the xlens binary
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::future_not_send
)]

use clap::Parser;
use dotenvy::dotenv;
use xlens_logging::cli::{LoggingConfig, LoggingConfigBuilderExt};
use xlens_reset::BatchExitCode;

mod commands {
    pub(crate) mod common;
    pub(crate) mod problematic_translogs;
    pub(crate) mod test_connection;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, Parser)]
#[clap(
    name = "xlens",
    version = env!("CARGO_PKG_VERSION"),
    about = "CrateDB maintenance tools",
    long_about = r#"CrateDB maintenance tools

Examples:
    # Show tables whose replicas carry oversized uncommitted translogs
    xlens problematic-translogs --size-mb 512

    # Print the statements of a manual replica reset
    xlens problematic-translogs --execute

    # Preview a replica reset of tables over 150% of their adaptive threshold
    xlens problematic-translogs --autoexec --dry-run --percentage 150

    # Reset replicas, logging the audit trail as JSON
    xlens problematic-translogs --autoexec --log-format json

    # Check connectivity, reading the connection from CRATE_CONNECTION_STRING
    xlens test-connection
"#
)]
struct Config {
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Parser)]
enum Command {
    /// Find replicas with oversized uncommitted translogs and optionally reset their tables
    ProblematicTranslogs(commands::problematic_translogs::Config),

    /// Check that the cluster answers SQL requests
    TestConnection(commands::test_connection::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    // usage errors exit with 1; 2 is reserved for a batch where every table failed
    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(ReturnCode::Failure as _);
        }
    };

    // replica resets run one table at a time; a single thread is all they need
    let tokio_runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    tokio_runtime.block_on(async move {
        fn handle_init_logs(r: Result<(), xlens_logging::Error>) {
            if let Err(e) = r {
                eprintln!("Initializing logs failed: {e}");
                std::process::exit(ReturnCode::Failure as _);
            }
        }

        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::ProblematicTranslogs(config)) => {
                handle_init_logs(init_logs(&config.logging_config));
                match commands::problematic_translogs::command(config).await {
                    Ok(BatchExitCode::Success) => {}
                    Ok(code) => std::process::exit(code.code()),
                    Err(e) => {
                        eprintln!("Problematic translogs command failed: {e}");
                        std::process::exit(BatchExitCode::Failure.code())
                    }
                }
            }
            Some(Command::TestConnection(config)) => {
                handle_init_logs(init_logs(&config.logging_config));
                if let Err(e) = commands::test_connection::command(config).await {
                    eprintln!("Test connection command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // a missing .env is fine, defaults apply
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}

fn init_logs(config: &LoggingConfig) -> Result<(), xlens_logging::Error> {
    xlens_logging::Builder::new()
        .with_default_log_filter("info")?
        .with_logging_config(config)?
        .install_global()
}
