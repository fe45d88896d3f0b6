mod common;

use std::{
    collections::HashMap,
    fs,
    sync::Arc,
    thread,
    time::Duration,
};

use loopman::{
    supervisor::{ProcessSupervisor, detached_log_handler},
    watchdog::client::WatchdogClient,
};
use tempfile::tempdir;

fn supervisor() -> ProcessSupervisor {
    ProcessSupervisor::new(
        WatchdogClient::disabled(),
        Arc::new(|_| {}),
        detached_log_handler(),
    )
}

#[test]
fn stop_kills_detached_descendants() {
    let temp = tempdir().unwrap();
    let pid_dir = temp.path().join("pids");
    fs::create_dir_all(&pid_dir).unwrap();

    // The service backgrounds three children; stopping it must take the
    // whole process group down, not just the immediate shell.
    let command = format!(
        r#"
        nohup sh -c 'echo $$ > {0}/child_1.pid && exec sleep 60' >/dev/null 2>&1 &
        nohup sh -c 'echo $$ > {0}/child_2.pid && exec sleep 60' >/dev/null 2>&1 &
        nohup sh -c 'echo $$ > {0}/child_3.pid && exec sleep 60' >/dev/null 2>&1 &
        exec sleep 60
        "#,
        pid_dir.display()
    );

    let supervisor = supervisor();
    supervisor
        .spawn("spawner", &command, temp.path(), &HashMap::new())
        .unwrap();

    let mut child_pids = vec![];
    assert!(common::wait_until(Duration::from_secs(3), || {
        child_pids.clear();
        for i in 1..=3 {
            if let Ok(content) = fs::read_to_string(pid_dir.join(format!("child_{i}.pid")))
                && let Ok(pid) = content.trim().parse::<u32>()
            {
                child_pids.push(pid);
            }
        }
        child_pids.len() == 3
    }));

    for &pid in &child_pids {
        assert!(
            common::is_process_alive(pid),
            "child {pid} should be alive before stop"
        );
    }

    supervisor.stop("spawner").unwrap();

    for &pid in &child_pids {
        assert!(
            common::wait_until(Duration::from_secs(2), || !common::is_process_alive(pid)),
            "child {pid} should be terminated after stop"
        );
    }
}

#[test]
fn second_spawn_is_rejected_while_first_is_alive() {
    let supervisor = supervisor();
    let temp = tempdir().unwrap();

    let pid = supervisor
        .spawn("solo", "sleep 30", temp.path(), &HashMap::new())
        .unwrap();
    assert!(supervisor
        .spawn("solo", "sleep 30", temp.path(), &HashMap::new())
        .is_err());

    // The original process is still the tracked one.
    assert_eq!(supervisor.pid_of("solo"), Some(pid));
    assert!(common::is_process_alive(pid));

    supervisor.stop("solo").unwrap();
    assert!(common::wait_until(Duration::from_secs(2), || {
        !common::is_process_alive(pid)
    }));
}

#[test]
fn stop_is_idempotent() {
    let supervisor = supervisor();
    let temp = tempdir().unwrap();

    supervisor
        .spawn("twice", "sleep 30", temp.path(), &HashMap::new())
        .unwrap();
    supervisor.stop("twice").unwrap();
    supervisor.stop("twice").unwrap();
    assert!(!supervisor.is_running("twice"));
}

#[test]
fn stubborn_process_is_force_killed() {
    let supervisor = supervisor();
    let temp = tempdir().unwrap();

    let pid = supervisor
        .spawn(
            "stubborn",
            "trap '' TERM; sleep 60",
            temp.path(),
            &HashMap::new(),
        )
        .unwrap();

    // Let the shell install its trap before stopping.
    thread::sleep(Duration::from_millis(300));

    supervisor
        .stop_with_timeout("stubborn", Duration::from_millis(500))
        .unwrap();

    assert!(
        common::wait_until(Duration::from_secs(2), || !common::is_process_alive(pid)),
        "SIGKILL escalation should have terminated the process"
    );
}

#[test]
fn stop_all_terminates_every_service() {
    let supervisor = supervisor();
    let temp = tempdir().unwrap();

    let mut pids = vec![];
    for name in ["one", "two", "three"] {
        pids.push(
            supervisor
                .spawn(name, "sleep 30", temp.path(), &HashMap::new())
                .unwrap(),
        );
    }
    assert_eq!(supervisor.running_services().len(), 3);

    supervisor.stop_all(Duration::from_secs(3));

    assert!(supervisor.running_services().is_empty());
    for pid in pids {
        assert!(common::wait_until(Duration::from_secs(2), || {
            !common::is_process_alive(pid)
        }));
    }
}
