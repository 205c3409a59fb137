//! Coverage server entry point.
//!
//! Configuration comes from the `FUZZ_*` environment variables; the CLI
//! flags exist for local runs against captured output and override the
//! corresponding variables.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use covmatch_core::config::ServerConfig;
use covmatch_core::features::server::FuzzServer;

#[derive(Parser, Debug)]
#[command(name = "covmatch-server", about = "Coverage inference server for greybox fuzzing")]
struct Args {
    /// Static-analysis artifact directory (overrides FUZZ_STATIC_ANALYSIS_PATH)
    #[arg(short = 's', long)]
    static_analysis: Option<PathBuf>,

    /// Fuzzer I/O directory (overrides FUZZ_OUT_DIR_PATH)
    #[arg(short = 'o', long)]
    out_dir: Option<PathBuf>,

    /// Serve a single request and exit (same as FUZZ_NOT_START_SERVER)
    #[arg(long)]
    oneshot: bool,
}

fn run() -> covmatch_core::Result<()> {
    let args = Args::parse();
    if let Some(dir) = &args.static_analysis {
        std::env::set_var(covmatch_core::config::ENV_STATIC_ANALYSIS_PATH, dir);
    }
    if let Some(dir) = &args.out_dir {
        std::env::set_var(covmatch_core::config::ENV_OUT_DIR_PATH, dir);
    }

    let mut config = ServerConfig::from_env()?;
    config.oneshot |= args.oneshot;

    let mut server = FuzzServer::bootstrap(config.clone())?;
    if config.oneshot {
        server.run_oneshot()
    } else {
        server.run()
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "startup failed");
            ExitCode::FAILURE
        }
    }
}
