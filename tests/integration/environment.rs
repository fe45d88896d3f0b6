mod common;

use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use loopman::{
    config::{EnvironmentDefinition, InterfaceAlias, ServiceDefinition},
    environment::{AliasProvider, EnvPhase, EnvironmentCoordinator},
    state::{ServiceManager, ServiceStatus},
    watchdog::client::WatchdogClient,
};
use tempfile::tempdir;

/// Alias provider that only tracks which addresses are currently up.
struct FakeProvider {
    active: Mutex<Vec<String>>,
}

impl FakeProvider {
    fn new() -> Self {
        Self {
            active: Mutex::new(Vec::new()),
        }
    }

    fn active(&self) -> Vec<String> {
        self.active.lock().unwrap().clone()
    }
}

impl AliasProvider for FakeProvider {
    fn activate(&self, alias: &InterfaceAlias) -> Result<(), String> {
        self.active.lock().unwrap().push(alias.address.clone());
        Ok(())
    }

    fn deactivate(&self, alias: &InterfaceAlias) -> Result<(), String> {
        self.active.lock().unwrap().retain(|a| a != &alias.address);
        Ok(())
    }
}

fn service(id: &str, command: &str) -> ServiceDefinition {
    ServiceDefinition {
        id: id.into(),
        name: id.into(),
        ports: vec![],
        command: command.into(),
        enabled: true,
        order: 0,
    }
}

fn wait_for_status(
    manager: &ServiceManager,
    key: &str,
    expected: ServiceStatus,
    budget: Duration,
) -> bool {
    common::wait_until(budget, || manager.status(key) == expected)
}

#[test]
fn full_environment_round_trip() {
    let temp = tempdir().unwrap();
    let provider = Arc::new(FakeProvider::new());
    let manager = ServiceManager::new(WatchdogClient::disabled());
    let coordinator = EnvironmentCoordinator::new(
        manager.clone(),
        Arc::clone(&provider) as Arc<dyn AliasProvider>,
        temp.path().to_path_buf(),
    );

    let env = EnvironmentDefinition {
        name: "staging".into(),
        aliases: vec![InterfaceAlias {
            address: "127.0.1.1".into(),
            domain: None,
        }],
        services: vec![service("api", "sleep 30"), service("worker", "sleep 30")],
    };

    coordinator.activate(&env).unwrap();
    assert_eq!(coordinator.phase("staging"), EnvPhase::Active);
    assert_eq!(provider.active(), vec!["127.0.1.1".to_string()]);

    let api = EnvironmentCoordinator::service_key("staging", "api");
    let worker = EnvironmentCoordinator::service_key("staging", "worker");
    assert!(wait_for_status(&manager, &api, ServiceStatus::Running, Duration::from_secs(3)));
    assert!(wait_for_status(&manager, &worker, ServiceStatus::Running, Duration::from_secs(3)));

    // Past the toggle cooldown before turning it back off.
    thread::sleep(Duration::from_millis(600));

    coordinator.deactivate(&env).unwrap();
    assert_eq!(coordinator.phase("staging"), EnvPhase::Inactive);
    assert!(provider.active().is_empty());

    for key in [&api, &worker] {
        let snapshot = manager.snapshot(key).unwrap();
        assert_eq!(snapshot.status, ServiceStatus::Stopped);
        assert_eq!(snapshot.restart_count, 0);
        assert!(snapshot.last_error.is_none());
    }
}

#[test]
fn crashed_service_does_not_take_down_the_environment() {
    let temp = tempdir().unwrap();
    let provider = Arc::new(FakeProvider::new());
    let manager = ServiceManager::new(WatchdogClient::disabled());
    let coordinator = EnvironmentCoordinator::new(
        manager.clone(),
        Arc::clone(&provider) as Arc<dyn AliasProvider>,
        temp.path().to_path_buf(),
    );

    let env = EnvironmentDefinition {
        name: "mixed".into(),
        aliases: vec![InterfaceAlias {
            address: "127.0.2.1".into(),
            domain: None,
        }],
        services: vec![service("stable", "sleep 30"), service("crashy", "exit 9")],
    };

    coordinator.activate(&env).unwrap();

    let stable = EnvironmentCoordinator::service_key("mixed", "stable");
    let crashy = EnvironmentCoordinator::service_key("mixed", "crashy");

    assert!(wait_for_status(&manager, &crashy, ServiceStatus::Failed, Duration::from_secs(3)));
    assert!(wait_for_status(&manager, &stable, ServiceStatus::Running, Duration::from_secs(3)));

    // The crash is recorded on the service, not the environment.
    assert_eq!(coordinator.phase("mixed"), EnvPhase::Active);
    assert_eq!(
        manager.snapshot(&crashy).unwrap().last_error.as_deref(),
        Some("exited with code 9")
    );
    assert_eq!(provider.active(), vec!["127.0.2.1".to_string()]);

    thread::sleep(Duration::from_millis(600));
    coordinator.deactivate(&env).unwrap();
    assert_eq!(coordinator.phase("mixed"), EnvPhase::Inactive);
}

#[test]
fn commands_are_resolved_against_aliases_at_spawn() {
    let temp = tempdir().unwrap();
    let marker = temp.path().join("resolved.txt");
    let provider = Arc::new(FakeProvider::new());
    let manager = ServiceManager::new(WatchdogClient::disabled());
    let coordinator = EnvironmentCoordinator::new(
        manager.clone(),
        Arc::clone(&provider) as Arc<dyn AliasProvider>,
        temp.path().to_path_buf(),
    );

    let env = EnvironmentDefinition {
        name: "tokens".into(),
        aliases: vec![
            InterfaceAlias {
                address: "127.0.3.1".into(),
                domain: None,
            },
            InterfaceAlias {
                address: "127.0.3.2".into(),
                domain: None,
            },
        ],
        services: vec![service(
            "echoer",
            &format!("echo \"$IP2 and $IP\" > {}; sleep 30", marker.display()),
        )],
    };

    coordinator.activate(&env).unwrap();

    assert!(common::wait_until(Duration::from_secs(3), || marker.exists()));
    let contents = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(contents.trim(), "127.0.3.2 and 127.0.3.1");

    thread::sleep(Duration::from_millis(600));
    coordinator.deactivate(&env).unwrap();
}
