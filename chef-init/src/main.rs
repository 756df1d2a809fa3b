use std::process::ExitCode;

use chef_init::cli::{self, Cli, HostEnv, Mode};
use chef_init::config::{self, InitConfig};
use chef_init::error::{InitError, InitResult};
use chef_init::orchestrator::{Orchestrator, RunMode};
use chef_init::{signals, verify};
use clap::Parser;
use pid1::ProcessRegistry;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mode = match cli.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("{}", e.diagnostic());
            return ExitCode::FAILURE;
        }
    };
    if mode == Mode::Version {
        println!("ChefInit Version: {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_common::log::init(&cli.log_level) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    match run(&cli, mode).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("{}", e.diagnostic());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, mode: Mode) -> InitResult<i32> {
    let init = match &cli.init_config {
        Some(path) => config::load(path).await?,
        None => InitConfig::default(),
    };

    pid1::signals::setup_signal_dispositions();
    if !pid1::signals::is_pid1() {
        if let Err(e) = pid1::signals::become_subreaper() {
            warn!(error = %e, "could not become a child subreaper");
        }
    }
    let registry = ProcessRegistry::new();

    let run_mode = match mode {
        Mode::Verify => {
            let report = verify::verify(&init.layout(), &registry).await;
            println!("{}", report.summary());
            return Ok(if report.success() { 0 } else { 1 });
        }
        Mode::Onboot => RunMode::Onboot,
        Mode::Bootstrap => RunMode::Bootstrap,
        Mode::Version => return Err(InitError::Usage("unexpected --version".to_string())),
    };

    let settings = cli::resolve(cli, &init, &HostEnv::from_process())?;
    info!(mode = ?run_mode, config = %settings.client.config_file.display(), "starting chef-init");

    let (events_tx, events_rx) = mpsc::channel(8);
    let forwarder = signals::spawn_event_forwarder(events_tx);
    let code = Orchestrator::new(settings, registry, events_rx)
        .run(run_mode, tokio::io::stdout())
        .await;
    forwarder.abort();
    code
}
