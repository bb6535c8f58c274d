//! `sheetshare` — open a JSON table for live editing over WebSocket.
//!
//! ```bash
//! sheetshare serve people.json
//! sheetshare serve people.json --bind 0.0.0.0:8000 --dtype joined=datetime
//! sheetshare serve people.json --solo --output edited.json
//! ```
//!
//! The server runs until an editor sends `shutdown` or `cancel` (or the
//! process gets Ctrl-C, which counts as shutdown). On shutdown the edited
//! table is written back in the input's shape; on cancel nothing is written.

mod io;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sheetshare_collab::{EditServer, ServerConfig, SessionMode, SessionOutcome};
use sheetshare_core::DType;
use std::path::PathBuf;
use tokio::net::TcpListener;

use io::DtypeOverrides;

#[derive(Parser, Debug)]
#[command(name = "sheetshare")]
#[command(version, about = "Share a table for live collaborative editing")]
struct Cli {
    /// Log filter (error, warn, info, debug, trace). RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info", env = "SHEETSHARE_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a JSON dataset until the session ends
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// JSON file: an array of row objects or an object of column arrays
    input: PathBuf,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    bind: String,

    /// Where to write the final table (defaults to overwriting INPUT)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Single-editor mode without presence traffic
    #[arg(long)]
    solo: bool,

    /// Store edits as typed instead of coercing them to column types
    #[arg(long)]
    no_strict: bool,

    /// Pin a column's type, e.g. `--dtype joined=datetime` (repeatable)
    #[arg(long = "dtype", value_name = "COLUMN=TYPE", value_parser = io::parse_dtype_override)]
    dtypes: Vec<(String, DType)>,

    /// Maximum simultaneous editors
    #[arg(long, default_value_t = 100)]
    max_editors: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level.as_str()))
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let overrides: DtypeOverrides = args.dtypes.into_iter().collect();
    let (table, format) = io::load(&args.input, &overrides)?;

    let config = ServerConfig {
        bind_addr: args.bind,
        max_editors: args.max_editors,
        strict_types: !args.no_strict,
        mode: if args.solo {
            SessionMode::Solo
        } else {
            SessionMode::Collaborative
        },
        ..ServerConfig::default()
    };
    let server = EditServer::new(config, table);
    let session = server.session().clone();

    let listener = TcpListener::bind(server.bind_addr())
        .await
        .with_context(|| format!("binding {}", server.bind_addr()))?;
    log::info!("Editing session open at ws://{}", listener.local_addr()?);

    let serving = tokio::spawn(async move { server.serve(listener).await });

    let outcome = tokio::select! {
        outcome = session.wait_for_end() => outcome,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, shutting the session down");
            if let Err(e) = session.shutdown().await {
                log::debug!("Shutdown after interrupt: {e}");
            }
            session.wait_for_end().await
        }
    };
    serving.await??;

    let output = args.output.as_deref().unwrap_or(&args.input);
    match outcome {
        SessionOutcome::Shutdown(table) => io::save(output, &table, format)?,
        SessionOutcome::Cancelled(_) => {
            log::info!("Session cancelled; {} left untouched", output.display());
        }
    }
    Ok(())
}
