#![deny(rust_2018_compatibility)]
#![warn(rust_2018_idioms)]

use log::info;
use std::path::PathBuf;
use structopt::StructOpt;
use tlstunnel::{stats, Broker, Config, Error};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};

/// TLS tunnel broker for an authorization service.
#[derive(Debug, StructOpt)]
#[structopt(setting = structopt::clap::AppSettings::ColoredHelp)]
struct CliArgs {
    /// Start the tunnel server
    #[structopt(
        name = "tunnel",
        short = "t",
        long = "tunnel",
        conflicts_with_all = &["stats", "detailed-stats"]
    )]
    tunnel: bool,

    /// Get current global stats from a RUNNING tunnel server
    #[structopt(
        name = "stats",
        short = "s",
        long = "stats",
        conflicts_with = "detailed-stats"
    )]
    stats: bool,

    /// Get current detailed stats from a RUNNING tunnel server
    #[structopt(name = "detailed-stats", short = "d", long = "detailed-stats")]
    detailed_stats: bool,

    /// Config file to use
    #[structopt(
        short = "c",
        long = "config",
        default_value = "/etc/tlstunnel/tlstunnel.toml"
    )]
    config: PathBuf,

    /// Force IPv6 for the tunnel listener
    #[structopt(short = "6", long = "ipv6")]
    ipv6: bool,
}

fn main() {
    use std::io::{self, Write};

    if let Err(err) = run() {
        let stderr = io::stderr();
        let mut out = stderr.lock();
        // cannot handle a write error here, we are already in the outermost layer
        let _ = writeln!(out, "An error occured:");
        for fail in err.iter_chain() {
            let _ = writeln!(out, "  {}", fail);
        }
        let _ = writeln!(out, "{}", err.backtrace());
        std::process::exit(1);
    }
}

fn run() -> Result<(), failure::Error> {
    let cli_args = CliArgs::from_args();
    let cfg = Config::try_load(&cli_args.config)?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cfg.loglevel.as_str()))
        .format_timestamp_millis()
        .init();

    if cli_args.tunnel {
        tunnel_main(&cli_args, cfg)?;
    } else if cli_args.stats || cli_args.detailed_stats {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let reply = runtime.block_on(stats::query_server_stats(&cfg, cli_args.detailed_stats))?;
        print!("{}", reply);
    } else {
        CliArgs::clap().print_long_help()?;
        println!();
    }
    Ok(())
}

fn tunnel_main(cli_args: &CliArgs, cfg: Config) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let broker = Broker::bind(cfg, cli_args.ipv6).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            let signals = signal(SignalKind::interrupt())
                .and_then(|sigint| signal(SignalKind::terminate()).map(|sigterm| (sigint, sigterm)));
            match signals {
                Ok((mut sigint, mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => info!("SIGINT received"),
                        _ = sigterm.recv() => info!("SIGTERM received"),
                    }
                    let _ = stop_tx.send(true);
                }
                Err(err) => {
                    log::warn!("Signal not available: {}", err);
                    // keep the stop flag's sender alive regardless
                    std::future::pending::<()>().await;
                }
            }
        });

        broker.run(stop_rx).await
    })
}
