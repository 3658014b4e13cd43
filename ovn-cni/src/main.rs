use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use ovn_cni::config::{Cli, Commands};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal.cancel();
        }
    });

    let result = match args.command {
        Commands::Controller(args) => {
            setup_logging(None);
            // the election mechanism lives outside this binary; a single
            // replica leads by default
            let leader = Arc::new(AtomicBool::new(true));
            ovn_cni::controller::start(args, leader, cancel).await
        }
        Commands::Daemon(args) => {
            let _guard = setup_logging(Some(&args.log_dir));
            ovn_cni::daemon::start(args, cancel).await
        }
        Commands::CrdGen => ovn_cni_crds::crd_gen_all().map_err(Into::into),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "exited with error");
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(
    file_dir: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ovn_cni=info".into());
    match file_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "cni-server.log");
            let (nonblocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(nonblocking))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}
