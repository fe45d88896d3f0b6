use std::{error::Error, path::PathBuf, sync::Arc, sync::mpsc};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use loopman::{
    cli::{Cli, Commands, parse_args},
    config::{EnvironmentDefinition, default_config_path, load_environments},
    constants::STOP_TIMEOUT,
    environment::{EnvironmentCoordinator, ShellAliasProvider},
    ipc,
    resolver,
    state::ServiceManager,
    watchdog::{OrphanWatchdog, client::WatchdogClient},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Up {
            config,
            environment,
        } => run_environment(config, &environment),
        Commands::List { config, json } => list_environments(config, json),
        Commands::Resolve {
            config,
            environment,
            service,
        } => resolve_service(config, &environment, &service),
        Commands::Watchdog { socket } => run_watchdog(socket),
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn config_path(config: Option<PathBuf>) -> PathBuf {
    config.unwrap_or_else(default_config_path)
}

fn find_environment(
    config: Option<PathBuf>,
    name: &str,
) -> Result<EnvironmentDefinition, Box<dyn Error>> {
    let path = config_path(config);
    let environments = load_environments(&path)?;
    environments
        .into_iter()
        .find(|e| e.name == name)
        .ok_or_else(|| format!("environment '{name}' not found in {}", path.display()).into())
}

fn run_environment(config: Option<PathBuf>, name: &str) -> Result<(), Box<dyn Error>> {
    let definition = find_environment(config, name)?;

    let watchdog = match ipc::watchdog_socket_path() {
        Ok(socket) => WatchdogClient::new(socket),
        Err(err) => {
            warn!("Watchdog socket unavailable ({err}); running without orphan protection");
            WatchdogClient::disabled()
        }
    };
    watchdog.register();

    let manager = ServiceManager::new(watchdog.clone());
    let coordinator = EnvironmentCoordinator::new(
        manager.clone(),
        Arc::new(ShellAliasProvider::new()),
        std::env::current_dir()?,
    );

    coordinator.activate(&definition)?;

    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    info!("Environment '{name}' is up; press Ctrl-C to deactivate");
    let _ = rx.recv();

    info!("Shutting down environment '{name}'");
    if let Err(err) = coordinator.deactivate(&definition) {
        error!("Deactivation failed: {err}");
        manager.stop_all(STOP_TIMEOUT);
    }
    watchdog.unregister();
    Ok(())
}

fn list_environments(config: Option<PathBuf>, json: bool) -> Result<(), Box<dyn Error>> {
    let environments = load_environments(&config_path(config))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&environments)?);
        return Ok(());
    }

    if environments.is_empty() {
        println!("No environments defined");
        return Ok(());
    }

    for environment in &environments {
        println!("{}", environment.name);
        for alias in &environment.aliases {
            match &alias.domain {
                Some(domain) => println!("  alias {} ({domain})", alias.address),
                None => println!("  alias {}", alias.address),
            }
        }
        for service in &environment.services {
            let marker = if service.enabled { "" } else { " (disabled)" };
            println!("  service {}{marker}: {}", service.id, service.command);
        }
    }
    Ok(())
}

fn resolve_service(
    config: Option<PathBuf>,
    environment: &str,
    service: &str,
) -> Result<(), Box<dyn Error>> {
    let definition = find_environment(config, environment)?;
    let Some(target) = definition.services.iter().find(|s| s.id == service) else {
        return Err(format!(
            "service '{service}' not found in environment '{environment}'"
        )
        .into());
    };

    let addresses = definition.addresses();
    let missing = resolver::missing_variables(&target.command, &addresses);
    for token in &missing {
        warn!("Token {token} has no matching alias in '{environment}'");
    }

    println!("{}", resolver::resolve_command(&target.command, &addresses));
    Ok(())
}

fn run_watchdog(socket: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let socket = match socket {
        Some(path) => path,
        None => ipc::watchdog_socket_path()?,
    };

    let watchdog = OrphanWatchdog::new();
    watchdog.run(&socket)?;
    Ok(())
}
