//! `conductor` – Conductor command line entry point.
//!
//! 1. Loads `~/.conductor/config.toml`, writing a demo configuration on first
//!    run.
//! 2. Registers the configured simulated modules and brings them up in
//!    dependency order.
//! 3. Serves the HTTP/WebSocket gateway.
//! 4. Intercepts **Ctrl-C** and shuts every module down in reverse order.

mod config;

use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use conductor_gateway::GatewayServer;
use conductor_runtime::{Orchestrator, init_tracing};
use conductor_types::ConductorError;

use config::ConductorConfig;

fn main() {
    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            ConductorConfig::default()
        }
    };

    let guard = init_tracing("conductor", &cfg.logging);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            drop(guard);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(run(cfg));
    drop(runtime);
    drop(guard);

    if let Err(e) = result {
        eprintln!("{}: {}", "conductor".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cfg: ConductorConfig) -> Result<(), ConductorError> {
    let orchestrator = Orchestrator::new(cfg.orchestrator.clone());
    let health_interval = Duration::from_millis(cfg.orchestrator.health.heartbeat_interval_ms);

    for entry in &cfg.modules {
        orchestrator.register_with_config(
            entry.descriptor(),
            Arc::new(entry.simulate(health_interval)),
            entry.module_config(),
        )?;
    }
    info!(modules = cfg.modules.len(), "modules registered");

    match orchestrator.start_all().await {
        Ok(()) => println!("  {} all modules running", "✓".green()),
        Err(e) => {
            warn!(unstarted = ?e.unstarted, failed = ?e.failed, "partial startup");
            println!("  {} {}", "⚠".yellow(), e);
        }
    }

    let gateway = GatewayServer::new(orchestrator.clone())
        .with_port(cfg.gateway.port)
        .with_rate_limit(cfg.gateway.commands_per_second);
    println!(
        "  Gateway listening on {}",
        format!("http://0.0.0.0:{}", gateway.port()).bold()
    );
    let mut gateway_task = tokio::spawn(gateway.run());

    let interrupted = Arc::new(Notify::new());
    let notifier = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || notifier.notify_one()) {
        warn!(error = %e, "failed to install Ctrl-C handler; use the gateway to stop modules");
    }

    let outcome = tokio::select! {
        _ = interrupted.notified() => {
            println!();
            println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
            Ok(())
        }
        joined = &mut gateway_task => match joined {
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Ok(()),
            Err(e) => Err(ConductorError::Io(format!("gateway task ended: {e}"))),
        },
    };

    let report = orchestrator.shutdown().await;
    gateway_task.abort();

    for id in &report.stopped {
        println!("  {} {} stopped", "✓".green(), id);
    }
    for id in &report.failed {
        println!("  {} {} did not stop cleanly", "✗".red(), id);
    }
    outcome
}

fn first_run() -> ConductorConfig {
    let cfg = ConductorConfig::demo();
    let path = config::config_path();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  No config found – wrote a demo configuration to {}",
            path.display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Could not save config".yellow(), e),
    }
    cfg
}

fn print_banner() {
    println!();
    println!("{}", r#"  ______                __           __            "#.bold().cyan());
    println!("{}", r#" / ____/___  ____  ____/ /_  _______/ /_____  _____ "#.bold().cyan());
    println!("{}", r#"/ /   / __ \/ __ \/ __  / / / / ___/ __/ __ \/ ___/ "#.bold().cyan());
    println!("{}", r#"/ /___/ /_/ / / / / /_/ / /_/ / /__/ /_/ /_/ / /    "#.bold().cyan());
    println!("{}", r#"\____/\____/_/ /_/\__,_/\__,_/\___/\__/\____/_/     "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Conductor".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Humanoid robot module orchestrator");
    println!();
}
