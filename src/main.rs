use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use llm_rpc_shim::config::{Cli, Config};
use llm_rpc_shim::shell::{Flow, History, Shell};
use llm_rpc_shim::transport::{EngineBackend, MockEngine, NativeLibrary};
use llm_rpc_shim::EngineSession;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging. Logs go to stderr so responses stay readable.
    let filter = if cli.verbose {
        "llm_rpc_shim=debug"
    } else {
        "llm_rpc_shim=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    info!("llm-rpc-shim v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?.merge_cli(&cli);

    // Open the engine.
    let backend: Arc<dyn EngineBackend> = if cli.mock {
        info!("Using the built-in stub engine");
        Arc::new(MockEngine::new(config.mock.timing()))
    } else {
        let path = config
            .library
            .path
            .clone()
            .context("no engine library given; pass a path or --mock")?;
        anyhow::ensure!(path.is_file(), "engine library not found: {}", path.display());
        Arc::new(NativeLibrary::open(&path)?)
    };

    let mut history = History::load(config.shell.history_path());
    let mut shell = Shell::new(EngineSession::new(backend), config);
    let mut stdout = std::io::stdout();

    if let Some(script) = &cli.bootstrap {
        anyhow::ensure!(script.is_file(), "bootstrap file not found: {}", script.display());
        info!(script = %script.display(), "Running bootstrap");
        if shell.run_script(script, &mut stdout).await? == Flow::Quit {
            return Ok(());
        }
    }

    println!("Interactive shell. Type `help` for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        stdout.flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        history.push(&line);

        match shell.run_line(&line, &mut stdout).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => {
                error!("{e}");
                println!("Error: {e}");
            }
        }
    }

    Ok(())
}
