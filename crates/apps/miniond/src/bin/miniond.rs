use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miniond::config::ServerConfig;
use miniond::{server, unix_now};
use minion_keys::KeyRing;

#[derive(Parser, Debug)]
#[command(name = "miniond", about = "Mix-network relay daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay's main loop.
    Server {
        #[arg(short = 'f', long = "config", default_value = "/etc/miniond.conf")]
        config: PathBuf,
    },
    /// Create additional key sets.
    Keygen {
        #[arg(short = 'f', long = "config", default_value = "/etc/miniond.conf")]
        config: PathBuf,
        #[arg(short = 'n', long = "keys", default_value_t = 1)]
        count: u32,
    },
    /// Purge expired key sets; optionally delete the identity key.
    RemoveKeys {
        #[arg(short = 'f', long = "config", default_value = "/etc/miniond.conf")]
        config: PathBuf,
        #[arg(long)]
        remove_identity: bool,
    },
}

fn load_config(path: &PathBuf) -> Result<ServerConfig, ExitCode> {
    ServerConfig::load(path).map_err(|err| {
        eprintln!("{err}");
        ExitCode::FAILURE
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Server { config } => {
            let config = match load_config(&config) {
                Ok(config) => config,
                Err(code) => return code,
            };
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    eprintln!("failed to start runtime: {err}");
                    return ExitCode::FAILURE;
                }
            };
            match runtime.block_on(server::run(config)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    log::error!("exception while running server: {err}");
                    eprintln!("shutting down because of error: {err}");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Keygen { config, count } => {
            let config = match load_config(&config) {
                Ok(config) => config,
                Err(code) => return code,
            };
            let mut ring = match KeyRing::open(config.key_ring_config(Vec::new())) {
                Ok(ring) => ring,
                Err(err) => {
                    eprintln!("{err}");
                    return ExitCode::FAILURE;
                }
            };
            eprintln!("Creating {count} keys...");
            for done in 1..=count {
                if let Err(err) = ring.create(1, None, unix_now()) {
                    eprintln!("{err}");
                    return ExitCode::FAILURE;
                }
                eprintln!(".... ({done}/{count} done)");
            }
            ExitCode::SUCCESS
        }
        Command::RemoveKeys { config, remove_identity } => {
            let config = match load_config(&config) {
                Ok(config) => config,
                Err(code) => return code,
            };
            let mut ring = match KeyRing::open(config.key_ring_config(Vec::new())) {
                Ok(ring) => ring,
                Err(err) => {
                    eprintln!("{err}");
                    return ExitCode::FAILURE;
                }
            };
            if let Err(err) = ring.remove_dead(unix_now()) {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
            if remove_identity {
                if let Err(err) = ring.remove_identity(Duration::from_secs(10)) {
                    eprintln!("{err}");
                    return ExitCode::FAILURE;
                }
            }
            log::info!("done removing keys");
            ExitCode::SUCCESS
        }
    }
}
