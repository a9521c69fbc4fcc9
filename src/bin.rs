use std::path::{Path, PathBuf};
use std::sync::Arc;

use acme_renew::{
    acme::AcmeClient,
    cache::CertificateCache,
    error::Error,
    manager::{self, RenewalManager},
    model::RunFlags,
    notify::LogNotifier,
    plugins::DefaultPluginFactory,
    renewal_store::RenewalStore,
    settings::Settings,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use flexi_logger::Logger;
use log::{error, info};

/// Renews the ACME (RFC8555) certificates of every configured renewal
#[derive(Parser)]
#[clap(
    version = "0.3.0",
    author = "Bastian Kersting <bastian@cmbt.de>, Tobias Karius <tobias.karius@yahoo.de>, Elena Lilova <elena.lilova@gmx.de>, Dominik Jantschar <dominik.jantschar@web.de>"
)]
struct Opts {
    /// Directory holding settings.json, the renewals and the cache
    #[clap(long, default_value = "./acme-renew")]
    base_dir: PathBuf,
    /// The ACME server's directory URL, overrides the settings
    #[clap(short, long)]
    server: Option<String>,
    /// Enables debug output.
    #[clap(short, long)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the renewals that are due
    Renew {
        /// Only run the renewal with this id
        #[clap(long)]
        id: Option<String>,
        /// Run regardless of due dates
        #[clap(long)]
        force: bool,
        /// Never reuse cached certificates
        #[clap(long)]
        nocache: bool,
    },
    /// List the renewals and their last result
    List,
    /// Remove a renewal and its cached certificates
    Cancel {
        #[clap(long)]
        id: String,
    },
    /// Revoke the cached certificates of a renewal
    Revoke {
        #[clap(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() {
    let opts: Opts = Opts::parse();

    let level = if opts.verbose { "debug" } else { "info" };
    let _logger = Logger::with_str(level)
        .log_target(flexi_logger::LogTarget::StdOut)
        .start()
        .unwrap_or_else(|e| panic!("Logger initialization failed with {}", e));

    match run(opts).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(opts: Opts) -> Result<bool, Error> {
    std::fs::create_dir_all(&opts.base_dir)?;
    let mut settings = Settings::load(&opts.base_dir)?;
    if let Some(server) = opts.server {
        settings.acme.base_uri = server;
    }
    let store = RenewalStore::new(&opts.base_dir)?;
    let cache = CertificateCache::new(&opts.base_dir.join("cache"), settings.cache.clone())?;

    match opts.command {
        Command::List => {
            for renewal in store.list()? {
                let last = renewal
                    .history
                    .last()
                    .map(|result| match result.success {
                        Some(true) => format!("succeeded {}", result.date),
                        Some(false) => format!("failed {}", result.date),
                        None => format!("nothing to do {}", result.date),
                    })
                    .unwrap_or_else(|| "never run".to_owned());
                println!("{}\t{}\t{}", renewal.id, renewal.display_name(), last);
            }
            Ok(true)
        }
        Command::Cancel { id } => {
            manager::cancel(&store, &cache, &id)?;
            Ok(true)
        }
        Command::Renew { id, force, nocache } => {
            let manager = connect(&opts.base_dir, store, cache, settings).await?;
            let flags = RunFlags {
                force,
                ignore_cache: nocache,
                test: false,
            };
            let results = manager.run_all(flags, id.as_deref(), Utc::now()).await?;
            Ok(results.iter().all(|result| result.success != Some(false)))
        }
        Command::Revoke { id } => {
            let manager = connect(&opts.base_dir, store, cache, settings).await?;
            let revoked = manager.revoke(&id).await?;
            info!("Revoked {} certificates", revoked);
            Ok(true)
        }
    }
}

async fn connect(
    base_dir: &Path,
    store: RenewalStore,
    cache: CertificateCache,
    settings: Settings,
) -> Result<RenewalManager, Error> {
    let transport = AcmeClient::connect(&settings.acme, base_dir).await?;
    Ok(RenewalManager::new(
        store,
        Arc::new(cache),
        Arc::new(transport),
        Arc::new(DefaultPluginFactory::new(settings.clone())),
        Arc::new(settings),
        Box::new(LogNotifier),
    ))
}
