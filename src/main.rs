use clap::{Parser, Subcommand};
use psidmap::config;
use psidmap::mapping::{MapError, MapService, Protocol};
use psidmap::telemetry::{init_logging, LogConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "psidmap")]
#[command(about = "Port-mapping core of a MAP-T/MAP-E translator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Start the mapping tables and drive synthetic flows through them
    Run {
        /// Path to config.lock file
        #[arg(short, long, default_value = "config.lock")]
        config: PathBuf,

        /// Concurrent packet-processing workers
        #[arg(short, long, default_value_t = 4)]
        workers: usize,

        /// Internal hosts generating flows
        #[arg(long, default_value_t = 64)]
        hosts: u16,

        /// Seconds to run, 0 runs until Ctrl-C
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate config.lock from config.toml
    Generate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Output path for config.lock
        #[arg(short, long, default_value = "config.lock")]
        output: PathBuf,
    },
    /// Validate config.toml without generating lock file
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Config { action }) => {
            init_logging(None);
            match action {
                ConfigAction::Generate {
                    config: config_path,
                    output,
                } => cmd_config_generate(&config_path, &output),
                ConfigAction::Validate {
                    config: config_path,
                } => cmd_config_validate(&config_path),
            }
        }
        Some(Commands::Run {
            config: lock_path,
            workers,
            hosts,
            duration,
        }) => cmd_run(&lock_path, workers, hosts, duration),
        None => cmd_run(&PathBuf::from("config.lock"), 4, 64, 10),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_run(lock_path: &PathBuf, workers: usize, hosts: u16, duration: u64) -> Result<(), String> {
    let lock = config::load_lock(lock_path)
        .map_err(|e| format!("Failed to load {}: {}", lock_path.display(), e))?;
    let log_config: LogConfig = lock.logging.log_config();
    init_logging(Some(&log_config));

    info!("Loaded {}", lock_path.display());

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let service = Arc::new(MapService::start(&lock.mapping.settings()));

        let handles: Vec<_> = (0..workers.max(1))
            .map(|id| tokio::spawn(drive_flows(service.clone(), id, hosts.max(1))))
            .collect();

        if duration == 0 {
            info!("Running until Ctrl-C");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(duration)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }

        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }

        for (name, value) in service.metrics().export() {
            info!("{} = {}", name, value);
        }
        service.stop();
    });

    Ok(())
}

/// One packet-processing context: outbound lookups for random flows,
/// followed by the reply lookup
async fn drive_flows(service: Arc<MapService>, worker: usize, hosts: u16) {
    let mut rng = StdRng::from_os_rng();
    let destinations: Vec<Ipv4Addr> = (1..=16).map(|i| Ipv4Addr::new(198, 51, 100, i)).collect();

    debug!("Worker {} started", worker);
    loop {
        for _ in 0..64 {
            let host = rng.random_range(0..hosts);
            let src = Ipv4Addr::new(192, 168, (host >> 8) as u8, (host & 0xff) as u8);
            let dst = destinations[rng.random_range(0..destinations.len())];
            let protocol = if rng.random_ratio(1, 8) {
                Protocol::Icmp
            } else {
                Protocol::Udp
            };
            let src_port = rng.random_range(1024..=u16::MAX);

            match service.resolve_outbound(protocol, src, src_port, dst) {
                Ok(port) => {
                    if let Err(MapError::NotFound) = service.resolve_inbound(protocol, port, dst) {
                        warn!("Reply lookup missed {}:{} via port {}", src, src_port, port);
                    }
                }
                Err(e) => debug!("Worker {}: {}:{} -> {}: {}", worker, src, src_port, dst, e),
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn cmd_config_generate(config_path: &PathBuf, output_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Loading {}...", config_path.display());

    let content = std::fs::read_to_string(config_path)
        .map_err(|e| format!("Failed to read config file: {}", e))?;

    let cfg = config::parse(&content).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        return Err("Validation failed with errors".to_string());
    }

    let lock = config::generate_lock(&cfg, &content);
    let lock_toml =
        config::render_lock(&lock).map_err(|e| format!("Failed to serialize lock: {}", e))?;

    let output = format!(
        "# Generated by psidmap - DO NOT EDIT\n# Source: {} (hash: {})\n\n{}",
        config_path.display(),
        lock.source_hash,
        lock_toml
    );

    std::fs::write(output_path, output).map_err(|e| format!("Failed to write lock file: {}", e))?;

    println!("[INFO] Generated {}", output_path.display());
    Ok(())
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}
