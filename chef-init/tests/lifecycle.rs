//! Whole-process scenarios against a fake omnibus tree: shell scripts stand
//! in for runsvdir, sv and chef-client.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chef_init::client::ClientArgs;
use chef_init::credentials::Credentials;
use chef_init::{
    Event, InitError, Orchestrator, Phase, ReadinessStrategy, RunMode, Settings, ShutdownPolicy,
};
use init_common::Layout;
use pid1::signals::{become_subreaper, send_signal};
use pid1::{Pid, ProcessRegistry, Signal};
use serial_test::serial;
use tokio::sync::mpsc;
use tokio::time::timeout;

const SCENARIO_TIMEOUT: Duration = Duration::from_secs(30);

struct Host {
    dir: tempfile::TempDir,
    settings: Settings,
}

fn write_exe(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

impl Host {
    /// Fake runsvdir records the signals it gets; fake sv records its calls;
    /// fake chef-client records each run and then runs `client_body`.
    fn new(client_body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let layout = Layout::new(root.join("opt"));

        write_exe(
            &layout.runsvdir_bin(),
            &format!(
                "trap 'echo HUP >> {signals}; exit 0' HUP\nwhile :; do sleep 0.05; done\n",
                signals = root.join("runsvdir.log").display()
            ),
        );
        write_exe(
            &layout.sv_bin(),
            &format!(
                "echo \"$1 $(basename \"$2\")\" >> {}\n",
                root.join("sv.log").display()
            ),
        );

        let etc = root.join("etc");
        let secure = etc.join("secure");
        std::fs::create_dir_all(&secure).unwrap();
        let credentials = Credentials::in_secure_dir(&secure, etc.join(".node_name"));

        let settings = Settings {
            log_pipe: layout.log_pipe(),
            client: ClientArgs {
                config_file: etc.join("zero.rb"),
                json_attribs: etc.join("first-boot.json"),
                log_level: "info".into(),
                local_mode: true,
                environment: None,
                node_name: None,
            },
            credentials,
            remove_secure: true,
            supervisor_pid_file: root.join("supervisor.pid"),
            readiness: ReadinessStrategy::SettleDelay(Duration::from_millis(200)),
            shutdown: ShutdownPolicy {
                graceful_timeout: Duration::from_secs(3),
                ..ShutdownPolicy::default()
            },
            layout,
        };
        let host = Self { dir, settings };
        host.set_client_body(client_body);
        host
    }

    fn set_client_body(&self, client_body: &str) {
        write_exe(
            &self.settings.layout.bin_dir().join("chef-client"),
            &format!("echo \"$@\" >> {}\n{client_body}", self.path("client.log").display()),
        );
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn lines(&self, name: &str) -> Vec<String> {
        std::fs::read_to_string(self.path(name))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn orchestrator(&self) -> (Orchestrator, mpsc::Sender<Event>) {
        let (tx, rx) = mpsc::channel(8);
        let orchestrator = Orchestrator::new(self.settings.clone(), ProcessRegistry::new(), rx);
        (orchestrator, tx)
    }

    fn plant_credentials(&self) {
        let creds = &self.settings.credentials;
        std::fs::write(&creds.client_key, "client").unwrap();
        std::fs::write(&creds.node_name_file, "node-1").unwrap();
        std::fs::write(creds.secure_dir.join("encrypted_data_bag_secret"), "s").unwrap();
    }

    fn assert_torn_down(&self) {
        assert_eq!(self.lines("runsvdir.log"), ["HUP"]);
        assert!(!self.settings.supervisor_pid_file.exists());
        assert!(!self.settings.log_pipe.exists());
    }
}

async fn run_until<F>(host: &Host, mode: RunMode, wait_for: Phase, then: F) -> Result<i32, InitError>
where
    F: FnOnce(&mpsc::Sender<Event>),
{
    let (orchestrator, events) = host.orchestrator();
    let mut phases = orchestrator.phases();
    let run = tokio::spawn(orchestrator.run(mode, tokio::io::sink()));

    timeout(SCENARIO_TIMEOUT, phases.wait_for(|p| *p == wait_for))
        .await
        .unwrap()
        .unwrap();
    then(&events);

    let result = timeout(SCENARIO_TIMEOUT, run).await.unwrap().unwrap();
    assert_eq!(*phases.borrow(), Phase::Exited);
    result
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn bootstrap_exits_with_client_code_and_cleans_up() {
    let host = Host::new("exit 17\n");
    host.plant_credentials();
    std::fs::write(
        &host.settings.client.json_attribs,
        r#"{"container_service": {"web": {"command": "/usr/bin/web"}}}"#,
    )
    .unwrap();

    let (orchestrator, _events) = host.orchestrator();
    let code = timeout(SCENARIO_TIMEOUT, orchestrator.run(RunMode::Bootstrap, tokio::io::sink()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(code, 17);
    assert_eq!(host.lines("client.log").len(), 1);
    assert!(host.lines("client.log")[0].starts_with("-c "));

    // The declared service was staged, left disabled and stopped on exit.
    let staged = host.settings.layout.staging_dir().join("web");
    assert!(staged.join("run").exists());
    assert!(staged.join("down").exists());
    assert_eq!(host.lines("sv.log"), ["stop web", "exit web"]);

    let creds = &host.settings.credentials;
    assert!(!creds.client_key.exists());
    assert!(!creds.node_name_file.exists());
    assert!(creds.secure_dir.is_dir());
    assert_eq!(std::fs::read_dir(&creds.secure_dir).unwrap().count(), 0);
    host.assert_torn_down();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn onboot_keeps_supervising_until_shutdown() {
    let host = Host::new("exit 0\n");
    host.plant_credentials();

    let code = run_until(&host, RunMode::Onboot, Phase::Steady, |events| {
        events.try_send(Event::Shutdown).unwrap();
    })
    .await
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(host.lines("client.log").len(), 1);
    // A plain shutdown leaves credentials in place.
    assert!(host.settings.credentials.client_key.exists());
    host.assert_torn_down();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn onboot_failed_client_run_still_reaches_steady() {
    let host = Host::new("exit 1\n");

    let code = run_until(&host, RunMode::Onboot, Phase::Steady, |events| {
        events.try_send(Event::Shutdown).unwrap();
    })
    .await
    .unwrap();

    assert_eq!(code, 0);
    host.assert_torn_down();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn sigterm_in_steady_stops_enabled_services() {
    let host = Host::new("");
    let staged = host.settings.layout.staging_dir().join("web");
    // The fake client plays a recipe that enables the declared service.
    host.set_client_body(&format!("rm -f {}\nexit 0\n", staged.join("down").display()));
    std::fs::write(
        &host.settings.client.json_attribs,
        r#"{"container_service": {"web": {"command": "/usr/bin/web"}}}"#,
    )
    .unwrap();

    let (tx, rx) = mpsc::channel(8);
    let forwarder = chef_init::signals::spawn_event_forwarder(tx);
    let orchestrator = Orchestrator::new(host.settings.clone(), ProcessRegistry::new(), rx);
    let mut phases = orchestrator.phases();
    let run = tokio::spawn(orchestrator.run(RunMode::Onboot, tokio::io::sink()));

    timeout(SCENARIO_TIMEOUT, phases.wait_for(|p| *p == Phase::Steady))
        .await
        .unwrap()
        .unwrap();
    assert!(!staged.join("down").exists());
    send_signal(Pid::this(), Signal::SIGTERM).unwrap();

    let code = timeout(SCENARIO_TIMEOUT, run).await.unwrap().unwrap().unwrap();
    forwarder.abort();
    assert_eq!(code, 0);
    assert_eq!(host.lines("sv.log"), ["stop web", "exit web"]);
    assert!(!staged.join("down").exists());
    host.assert_torn_down();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn steady_reaps_orphans_left_by_the_client() {
    become_subreaper().unwrap();
    let host = Host::new("");
    let pid_file = host.path("orphan.pid");
    host.set_client_body(&format!("sleep 0.3 &\necho $! > {}\nexit 0\n", pid_file.display()));
    let (orchestrator, events) = host.orchestrator();
    let mut phases = orchestrator.phases();
    let run = tokio::spawn(orchestrator.run(RunMode::Onboot, tokio::io::sink()));

    timeout(SCENARIO_TIMEOUT, phases.wait_for(|p| *p == Phase::Steady))
        .await
        .unwrap()
        .unwrap();
    let orphan = std::fs::read_to_string(&pid_file).unwrap();
    let proc_entry = Path::new("/proc").join(orphan.trim());

    // A zombie keeps its /proc entry until it is reaped.
    timeout(SCENARIO_TIMEOUT, async {
        while proc_entry.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*phases.borrow(), Phase::Steady);

    events.send(Event::Shutdown).await.unwrap();
    let code = timeout(SCENARIO_TIMEOUT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(code, 0);
    host.assert_torn_down();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn rerun_request_runs_the_client_again() {
    let host = Host::new("exit 0\n");
    let (orchestrator, events) = host.orchestrator();
    let mut phases = orchestrator.phases();
    let run = tokio::spawn(orchestrator.run(RunMode::Onboot, tokio::io::sink()));

    timeout(SCENARIO_TIMEOUT, phases.wait_for(|p| *p == Phase::Steady))
        .await
        .unwrap()
        .unwrap();
    events.send(Event::RerunClient).await.unwrap();

    timeout(SCENARIO_TIMEOUT, async {
        while host.lines("client.log").len() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    timeout(SCENARIO_TIMEOUT, phases.wait_for(|p| *p == Phase::Steady))
        .await
        .unwrap()
        .unwrap();
    events.send(Event::Shutdown).await.unwrap();

    let code = timeout(SCENARIO_TIMEOUT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(code, 0);
    assert_eq!(host.lines("client.log").len(), 2);
    host.assert_torn_down();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn shutdown_and_clean_removes_credentials() {
    let host = Host::new("exit 0\n");
    host.plant_credentials();

    let code = run_until(&host, RunMode::Onboot, Phase::Steady, |events| {
        events.try_send(Event::ShutdownAndClean).unwrap();
    })
    .await
    .unwrap();

    assert_eq!(code, 0);
    let creds = &host.settings.credentials;
    assert!(!creds.client_key.exists());
    assert!(!creds.node_name_file.exists());
    assert!(!creds.secure_dir.join("encrypted_data_bag_secret").exists());
    host.assert_torn_down();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn shutdown_interrupts_a_running_client() {
    let host = Host::new("exec sleep 30\n");

    let started = std::time::Instant::now();
    let code = run_until(&host, RunMode::Onboot, Phase::ClientRunning, |events| {
        events.try_send(Event::Shutdown).unwrap();
    })
    .await
    .unwrap();

    assert_eq!(code, 0);
    assert!(started.elapsed() < Duration::from_secs(20));
    host.assert_torn_down();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn missing_client_still_stops_the_supervisor() {
    let host = Host::new("exit 0\n");
    host.plant_credentials();
    let (orchestrator, _events) = host.orchestrator();
    let orchestrator = orchestrator.with_client_program("definitely-not-chef-client");

    let err = timeout(SCENARIO_TIMEOUT, orchestrator.run(RunMode::Bootstrap, tokio::io::sink()))
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, InitError::Process(_)), "{err}");
    let creds = &host.settings.credentials;
    assert!(!creds.client_key.exists());
    assert!(!creds.node_name_file.exists());
    host.assert_torn_down();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn log_pipe_failure_aborts_before_launch() {
    let mut host = Host::new("exit 0\n");
    host.settings.log_pipe = host.path("missing/dir/logs");
    let (orchestrator, _events) = host.orchestrator();

    let err = orchestrator
        .run(RunMode::Bootstrap, tokio::io::sink())
        .await
        .unwrap_err();

    assert!(matches!(err, InitError::LogPipe(_)), "{err}");
    assert!(!host.settings.supervisor_pid_file.exists());
    assert!(host.lines("runsvdir.log").is_empty());
    assert!(host.lines("client.log").is_empty());
}
