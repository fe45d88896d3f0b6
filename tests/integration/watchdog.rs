mod common;

use std::{
    os::unix::process::CommandExt,
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

use loopman::{
    ipc::{self, WatchdogRequest},
    watchdog::{OrphanWatchdog, client::WatchdogClient},
};
use tempfile::tempdir;

fn start_daemon(socket: &std::path::Path) {
    let watchdog = OrphanWatchdog::new();
    let socket = socket.to_path_buf();
    let daemon_socket = socket.clone();
    thread::spawn(move || {
        let _ = watchdog.run(&daemon_socket);
    });
    assert!(common::wait_until(Duration::from_secs(2), || socket.exists()));
}

/// Spawns a `sleep` in its own process group; its PID doubles as the pgid.
fn spawn_group() -> Child {
    Command::new("sleep")
        .arg("60")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .unwrap()
}

fn sigkill(pid: u32) {
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    );
}

/// Polls `try_wait` so the child is reaped the moment it dies.
fn exits_within(child: &mut Child, budget: Duration) -> bool {
    common::wait_until(budget, || matches!(child.try_wait(), Ok(Some(_))))
}

#[test]
fn requests_are_answered_over_the_socket() {
    let temp = tempdir().unwrap();
    let socket = temp.path().join("watchdog.sock");
    start_daemon(&socket);

    // Group updates without a registration are refused.
    let reply = ipc::send_request(&socket, &WatchdogRequest::UpdateGroups { groups: vec![5] })
        .unwrap();
    assert!(!reply.ok);
    assert!(reply.error.is_some());

    let pid = std::process::id() as i32;
    let reply = ipc::send_request(&socket, &WatchdogRequest::Register { pid }).unwrap();
    assert!(reply.ok);

    let reply = ipc::send_request(&socket, &WatchdogRequest::UpdateGroups { groups: vec![5, 6] })
        .unwrap();
    assert!(reply.ok);

    let reply = ipc::send_request(&socket, &WatchdogRequest::Unregister).unwrap();
    assert!(reply.ok);
}

#[test]
fn application_death_reaps_tracked_groups() {
    let temp = tempdir().unwrap();
    let socket = temp.path().join("watchdog.sock");
    start_daemon(&socket);

    // A stand-in application and one service group it "owns".
    let mut app = spawn_group();
    let mut service = spawn_group();
    let service_pgid = service.id() as i32;

    let reply = ipc::send_request(
        &socket,
        &WatchdogRequest::Register {
            pid: app.id() as i32,
        },
    )
    .unwrap();
    assert!(reply.ok);

    let reply = ipc::send_request(
        &socket,
        &WatchdogRequest::UpdateGroups {
            groups: vec![service_pgid],
        },
    )
    .unwrap();
    assert!(reply.ok);

    // Kill the application ungracefully and reap it, so its PID actually
    // disappears; the watchdog must then terminate the tracked group.
    sigkill(app.id());
    app.wait().unwrap();

    assert!(
        exits_within(&mut service, Duration::from_secs(5)),
        "orphaned service group should be reaped after app death"
    );
}

#[test]
fn replacing_a_live_registration_cleans_up_its_groups() {
    let temp = tempdir().unwrap();
    let socket = temp.path().join("watchdog.sock");
    start_daemon(&socket);

    let mut first_app = spawn_group();
    let mut service = spawn_group();
    let service_pgid = service.id() as i32;

    let reply = ipc::send_request(
        &socket,
        &WatchdogRequest::Register {
            pid: first_app.id() as i32,
        },
    )
    .unwrap();
    assert!(reply.ok);

    let reply = ipc::send_request(
        &socket,
        &WatchdogRequest::UpdateGroups {
            groups: vec![service_pgid],
        },
    )
    .unwrap();
    assert!(reply.ok);

    // A second launch takes over while the first app is still alive. The
    // replaced registration's children must be cleaned up, not leaked.
    let reply = ipc::send_request(
        &socket,
        &WatchdogRequest::Register {
            pid: std::process::id() as i32,
        },
    )
    .unwrap();
    assert!(reply.ok);

    assert!(
        exits_within(&mut service, Duration::from_secs(5)),
        "replaced registration's group must be cleaned up on takeover"
    );

    sigkill(first_app.id());
    first_app.wait().unwrap();
}

#[test]
fn graceful_unregister_leaves_groups_alone() {
    let temp = tempdir().unwrap();
    let socket = temp.path().join("watchdog.sock");
    start_daemon(&socket);

    let mut app = spawn_group();
    let mut service = spawn_group();
    let service_pgid = service.id() as i32;

    ipc::send_request(
        &socket,
        &WatchdogRequest::Register {
            pid: app.id() as i32,
        },
    )
    .unwrap();
    ipc::send_request(
        &socket,
        &WatchdogRequest::UpdateGroups {
            groups: vec![service_pgid],
        },
    )
    .unwrap();
    let reply = ipc::send_request(&socket, &WatchdogRequest::Unregister).unwrap();
    assert!(reply.ok);

    // The app dies after unregistering; no cleanup may happen.
    sigkill(app.id());
    app.wait().unwrap();

    thread::sleep(Duration::from_millis(800));
    assert!(matches!(service.try_wait(), Ok(None)), "service must survive");

    sigkill(service.id());
    service.wait().unwrap();
}

#[test]
fn client_registers_lazily_on_first_sync() {
    let temp = tempdir().unwrap();
    let socket = temp.path().join("watchdog.sock");
    start_daemon(&socket);

    // No explicit register(); the first group mutation must establish the
    // registration on its own.
    let client = WatchdogClient::new(socket.clone());
    client.add_group(4242);
    assert_eq!(client.groups(), vec![4242]);

    // The registration the client created is live: further updates on the
    // same socket are accepted rather than refused.
    let reply = ipc::send_request(
        &socket,
        &WatchdogRequest::UpdateGroups { groups: vec![4242] },
    )
    .unwrap();
    assert!(reply.ok);
}
