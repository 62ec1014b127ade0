//! pc-proxy CLI - A parental control proxy with password bypass

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use pc_proxy::config::DEFAULT_CONFIG_FILE;
use pc_proxy::filter::RuleAccess;
use pc_proxy::{logging, reload, Config, ProxyServer, RuleEngine};

#[derive(Parser)]
#[command(name = "pc-proxy")]
#[command(about = "A parental control proxy with password bypass")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Run {
        /// Path to configuration file (.json or .toml)
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Write the process id to this file
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, pid_file } => run(&config, pid_file.as_deref()).await?,
        Commands::ValidateConfig { config } => validate(&config)?,
    }

    Ok(())
}

async fn run(config_path: &Path, pid_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::from_file(config_path)?;
    let log = logging::init(&cfg.logging)?;
    tracing::info!(path = %config_path.display(), "Configuration loaded");

    if let Some(pid_file) = pid_file {
        if let Err(e) = std::fs::write(pid_file, format!("{}\n", std::process::id())) {
            tracing::warn!(path = %pid_file.display(), error = %e, "Failed to write pid file");
        }
    }

    let mut server = ProxyServer::new(cfg);
    server.start().await?;

    let (reload_tx, mut reload_rx) = tokio::sync::mpsc::channel(1);
    reload::spawn_file_watcher(config_path.to_path_buf(), reload_tx.clone());
    #[cfg(unix)]
    reload::spawn_sighup_handler(reload_tx.clone());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(()) = reload_rx.recv() => {
                // Errors are logged by the reload itself
                let _ = reload::reload_config(config_path, &mut server, Some(&log));
            }
        }
    }

    let errors = server.stop().await;
    for e in &errors {
        tracing::error!(error = %e, "Shutdown error");
    }

    if let Some(pid_file) = pid_file {
        let _ = std::fs::remove_file(pid_file);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!("{} listener(s) failed to shut down cleanly", errors.len()).into())
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Shutting down...");
}

fn validate(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration: {}", config_path.display());

    let cfg = Config::from_file(config_path)?;

    println!("Configuration is valid!");
    println!();
    println!("  HTTP listen: {}", cfg.listen.http_address());
    if cfg.tls.enabled {
        println!("  HTTPS listen: {}", cfg.listen.https_address());
        println!("  Certificate: {}", cfg.tls.cert.as_deref().unwrap_or("(not set)"));
        println!("  Key: {}", cfg.tls.key.as_deref().unwrap_or("(not set)"));
        println!("  Ciphers: {}", cfg.tls.ciphers);
    } else {
        println!("  HTTPS: disabled");
    }
    println!("  Log level: {}", cfg.logging.level);
    println!("  Log encoding: {:?}", cfg.logging.encoding);

    let engine = RuleEngine::from_config(&cfg.rules);
    println!("  Rules: {}", engine.rule_count());

    if engine.rule_count() > 0 {
        println!();
        println!("Rules:");
        for (i, rule) in engine.rules().enumerate() {
            let bypass = if rule.access == RuleAccess::Block && rule.password_bypass {
                " [password bypass]"
            } else {
                ""
            };
            println!(
                "  {}. {} {} {}{}",
                i + 1,
                rule.access,
                rule.rule_type,
                rule.pattern,
                bypass
            );
        }
    }

    let dropped = cfg.rules.len() - engine.rule_count();
    if dropped > 0 {
        println!();
        println!("{} rule(s) dropped (empty pattern or invalid regex).", dropped);
    }

    Ok(())
}
