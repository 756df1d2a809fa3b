use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use init_common::Layout;
use log_pipe::Writer;
use tracing::{debug, error};

/// Forward a service's output into the chef-init log pipe.
///
/// Installed as `exec chef-init-logger --service-name <name>` in a
/// service's `log/run`, so runsv pipes the service's stdout into stdin.
#[derive(Parser)]
#[command(name = "chef-init-logger", version)]
struct Cli {
    /// Name used to prefix every line
    #[arg(short = 's', long)]
    service_name: String,

    /// Path of the log pipe
    #[arg(long, env = "CHEF_INIT_LOG_PIPE")]
    pipe: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_common::log::init("warn") {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let pipe = cli.pipe.unwrap_or_else(|| Layout::default().log_pipe());
    let mut writer = match Writer::open(&pipe, cli.service_name) {
        Ok(w) => w,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match writer.forward(std::io::stdin().lock()) {
        Ok(lines) => {
            debug!(service = %writer.service_name(), lines, "input closed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(service = %writer.service_name(), error = %e, "forwarding failed");
            ExitCode::FAILURE
        }
    }
}
