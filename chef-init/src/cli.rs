use std::path::{Path, PathBuf};

use clap::Parser;
use init_common::Layout;

use crate::client::ClientArgs;
use crate::config::InitConfig;
use crate::credentials::Credentials;
use crate::error::{InitError, InitResult};
use crate::supervisor::{ReadinessStrategy, ShutdownPolicy};

const ETC_CHEF: &str = "/etc/chef";
const DEFAULT_PID_FILE: &str = "/tmp/supervisor.pid";
const NODE_NAME_ENV: &str = "CHEF_NODE_NAME";

#[derive(Debug, Parser)]
#[command(
    name = "chef-init",
    about = "PID 1 for Chef containers",
    disable_version_flag = true
)]
pub struct Cli {
    /// Start the supervisor, converge once, then keep running until signaled
    #[arg(long)]
    pub onboot: bool,

    /// Start the supervisor, converge once, clean up credentials, and exit
    /// with chef-client's exit code
    #[arg(long)]
    pub bootstrap: bool,

    /// Verify the installation
    #[arg(long)]
    pub verify: bool,

    /// Print the version
    #[arg(short = 'v', long)]
    pub version: bool,

    /// The configuration file to use
    #[arg(short = 'c', long = "config", value_name = "CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Load attributes from a JSON file
    #[arg(short = 'j', long = "json-attributes", value_name = "JSON_ATTRIBS")]
    pub json_attribs: Option<PathBuf>,

    /// Point chef-client at the local repository
    #[arg(short = 'z', long = "local-mode")]
    pub local_mode: bool,

    /// Set the log level (debug, info, warn, error, fatal)
    #[arg(short = 'l', long = "log_level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Set the Chef environment on the node
    #[arg(short = 'E', long, value_name = "ENVIRONMENT")]
    pub environment: Option<String>,

    /// Remove secure credentials from the image after bootstrap (default)
    #[arg(long = "remove-secure", overrides_with = "no_remove_secure")]
    remove_secure: bool,

    /// Keep secure credentials after bootstrap
    #[arg(long = "no-remove-secure", overrides_with = "remove_secure")]
    no_remove_secure: bool,

    /// The directory where secure credentials can be found
    #[arg(long, value_name = "DIRECTORY")]
    pub secure_directory: Option<PathBuf>,

    /// Supervisor PID file location
    #[arg(long = "supervisor-pid", value_name = "PIDFILE")]
    pub supervisor_pid_file: Option<PathBuf>,

    /// The node name for this client
    #[arg(short = 'N', long = "node-name", value_name = "NODE_NAME")]
    pub node_name: Option<String>,

    /// The validation key file location
    #[arg(short = 'K', long = "validation_key", value_name = "KEY_FILE")]
    pub validation_key: Option<PathBuf>,

    /// The client key file location
    #[arg(short = 'k', long = "client_key", value_name = "KEY_FILE")]
    pub client_key: Option<PathBuf>,

    /// YAML file tuning paths, readiness, and shutdown signals
    #[arg(long = "init-config", value_name = "FILE")]
    pub init_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Version,
    Verify,
    Onboot,
    Bootstrap,
}

impl Cli {
    pub fn mode(&self) -> InitResult<Mode> {
        match (self.version, self.onboot, self.bootstrap, self.verify) {
            (true, ..) => Ok(Mode::Version),
            (_, true, true, _) => Err(InitError::Usage(
                "You must pass in either the --onboot OR the --bootstrap flag, but not both."
                    .to_string(),
            )),
            (_, true, _, _) => Ok(Mode::Onboot),
            (_, _, true, _) => Ok(Mode::Bootstrap),
            (_, _, _, true) => Ok(Mode::Verify),
            _ => Err(InitError::Usage(
                "You must pass in either the --onboot, --bootstrap, or --verify flag.".to_string(),
            )),
        }
    }

    pub fn remove_secure(&self) -> bool {
        self.remove_secure || !self.no_remove_secure
    }
}

/// Host facts consulted while resolving options.
#[derive(Debug, Clone)]
pub struct HostEnv {
    pub etc_chef: PathBuf,
    pub node_name_env: Option<String>,
}

impl HostEnv {
    pub fn from_process() -> Self {
        Self {
            etc_chef: PathBuf::from(ETC_CHEF),
            node_name_env: std::env::var(NODE_NAME_ENV).ok(),
        }
    }
}

/// Everything the orchestrator needs, resolved from flags, the optional
/// YAML file and the host.
#[derive(Debug, Clone)]
pub struct Settings {
    pub layout: Layout,
    pub log_pipe: PathBuf,
    pub client: ClientArgs,
    pub credentials: Credentials,
    pub remove_secure: bool,
    pub supervisor_pid_file: PathBuf,
    pub readiness: ReadinessStrategy,
    pub shutdown: ShutdownPolicy,
}

/// Resolve client defaults the way chef-client's own config discovery does.
///
/// Local mode wins if `zero.rb` exists, `-c` names a `zero.rb`, or `-z` is
/// given. Otherwise server mode needs a `client.rb` and at least one of the
/// validation or client keys. Anything else is a usage error.
pub fn resolve(cli: &Cli, init: &InitConfig, host: &HostEnv) -> InitResult<Settings> {
    let layout = init.layout();
    let secure_dir = cli
        .secure_directory
        .clone()
        .or_else(|| init.secure_directory.clone())
        .unwrap_or_else(|| host.etc_chef.join("secure"));
    let mut credentials =
        Credentials::in_secure_dir(&secure_dir, host.etc_chef.join(".node_name"));
    if let Some(key) = &cli.validation_key {
        credentials.validation_key = key.clone();
    }
    if let Some(key) = &cli.client_key {
        credentials.client_key = key.clone();
    }

    let zero_rb = host.etc_chef.join("zero.rb");
    let client_rb = host.etc_chef.join("client.rb");
    let (local_mode, default_config) =
        if zero_rb.exists() || config_named(cli, "zero.rb") || cli.local_mode {
            (true, zero_rb)
        } else if client_rb.exists() || config_named(cli, "client.rb") {
            if !credentials.validation_key.exists() && !credentials.client_key.exists() {
                return Err(InitError::Usage(format!(
                    "File {} is missing. Please make sure your secure credentials are accessible to the running container.",
                    credentials.validation_key.display()
                )));
            }
            (false, client_rb)
        } else {
            return Err(InitError::Usage(format!(
                "Cannot find a valid configuration file in {}",
                host.etc_chef.display()
            )));
        };

    let client = ClientArgs {
        config_file: cli.config_file.clone().unwrap_or(default_config),
        json_attribs: cli
            .json_attribs
            .clone()
            .unwrap_or_else(|| host.etc_chef.join("first-boot.json")),
        log_level: cli.log_level.clone(),
        local_mode,
        environment: cli.environment.clone(),
        node_name: node_name(cli, host, &credentials.node_name_file),
    };

    Ok(Settings {
        log_pipe: init.log_pipe.clone().unwrap_or_else(|| layout.log_pipe()),
        supervisor_pid_file: cli
            .supervisor_pid_file
            .clone()
            .or_else(|| init.supervisor_pid_file.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PID_FILE)),
        readiness: init.readiness_strategy(),
        shutdown: init.shutdown_policy(),
        remove_secure: cli.remove_secure(),
        layout,
        client,
        credentials,
    })
}

fn config_named(cli: &Cli, suffix: &str) -> bool {
    cli.config_file
        .as_ref()
        .is_some_and(|p| p.to_string_lossy().ends_with(suffix))
}

/// `-N`, then `CHEF_NODE_NAME`, then the `.node_name` marker file.
fn node_name(cli: &Cli, host: &HostEnv, marker: &Path) -> Option<String> {
    let non_empty = |s: String| {
        let s = s.trim().to_string();
        (!s.is_empty()).then_some(s)
    };
    cli.node_name
        .clone()
        .and_then(non_empty)
        .or_else(|| host.node_name_env.clone().and_then(non_empty))
        .or_else(|| std::fs::read_to_string(marker).ok().and_then(non_empty))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("chef-init").chain(args.iter().copied())).unwrap()
    }

    fn host() -> (tempfile::TempDir, HostEnv) {
        let dir = tempfile::tempdir().unwrap();
        let host = HostEnv {
            etc_chef: dir.path().to_path_buf(),
            node_name_env: None,
        };
        (dir, host)
    }

    #[test]
    fn mode_selection() {
        assert_eq!(parse(&["--onboot"]).mode().unwrap(), Mode::Onboot);
        assert_eq!(parse(&["--bootstrap"]).mode().unwrap(), Mode::Bootstrap);
        assert_eq!(parse(&["--verify"]).mode().unwrap(), Mode::Verify);
        assert_eq!(parse(&["-v"]).mode().unwrap(), Mode::Version);
        assert_eq!(parse(&["--version", "--onboot"]).mode().unwrap(), Mode::Version);
    }

    #[test]
    fn conflicting_or_missing_mode_is_usage_error() {
        let err = parse(&["--onboot", "--bootstrap"]).mode().unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("but not both"));
        assert!(parse(&[]).mode().unwrap_err().is_usage());
    }

    #[test]
    fn remove_secure_defaults_on_and_last_flag_wins() {
        assert!(parse(&["--bootstrap"]).remove_secure());
        assert!(!parse(&["--no-remove-secure"]).remove_secure());
        assert!(parse(&["--no-remove-secure", "--remove-secure"]).remove_secure());
    }

    #[test]
    fn zero_rb_selects_local_mode_defaults() {
        let (dir, host) = host();
        std::fs::write(dir.path().join("zero.rb"), "").unwrap();
        let settings = resolve(&parse(&["--onboot"]), &InitConfig::default(), &host).unwrap();
        assert!(settings.client.local_mode);
        assert_eq!(settings.client.config_file, dir.path().join("zero.rb"));
        assert_eq!(settings.client.json_attribs, dir.path().join("first-boot.json"));
        assert_eq!(settings.client.log_level, "info");
        assert_eq!(settings.supervisor_pid_file, PathBuf::from("/tmp/supervisor.pid"));
        assert_eq!(settings.log_pipe, PathBuf::from("/opt/chef/logs"));
    }

    #[test]
    fn dash_z_selects_local_mode_without_files() {
        let (_dir, host) = host();
        let settings = resolve(&parse(&["--bootstrap", "-z"]), &InitConfig::default(), &host).unwrap();
        assert!(settings.client.local_mode);
    }

    #[test]
    fn client_rb_requires_a_key() {
        let (dir, host) = host();
        std::fs::write(dir.path().join("client.rb"), "").unwrap();
        let err = resolve(&parse(&["--onboot"]), &InitConfig::default(), &host).unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("validation.pem"));

        std::fs::create_dir_all(dir.path().join("secure")).unwrap();
        std::fs::write(dir.path().join("secure/validation.pem"), "").unwrap();
        let settings = resolve(&parse(&["--onboot"]), &InitConfig::default(), &host).unwrap();
        assert!(!settings.client.local_mode);
        assert_eq!(settings.client.config_file, dir.path().join("client.rb"));
    }

    #[test]
    fn no_config_is_usage_error() {
        let (_dir, host) = host();
        let err = resolve(&parse(&["--onboot"]), &InitConfig::default(), &host).unwrap_err();
        assert!(err.to_string().starts_with("Cannot find a valid configuration file"));
    }

    #[test]
    fn explicit_flags_override_defaults() {
        let (dir, host) = host();
        std::fs::write(dir.path().join("zero.rb"), "").unwrap();
        let cli = parse(&[
            "--bootstrap",
            "-c",
            "/srv/chef/zero.rb",
            "-j",
            "/srv/chef/attrs.json",
            "-E",
            "staging",
            "-l",
            "debug",
            "--secure-directory",
            "/run/secrets",
            "--supervisor-pid",
            "/run/sv.pid",
            "-K",
            "/run/keys/validator.pem",
        ]);
        let settings = resolve(&cli, &InitConfig::default(), &host).unwrap();
        assert_eq!(settings.client.config_file, PathBuf::from("/srv/chef/zero.rb"));
        assert_eq!(settings.client.json_attribs, PathBuf::from("/srv/chef/attrs.json"));
        assert_eq!(settings.client.environment.as_deref(), Some("staging"));
        assert_eq!(settings.client.log_level, "debug");
        assert_eq!(settings.credentials.secure_dir, PathBuf::from("/run/secrets"));
        assert_eq!(
            settings.credentials.client_key,
            PathBuf::from("/run/secrets/client.pem")
        );
        assert_eq!(
            settings.credentials.validation_key,
            PathBuf::from("/run/keys/validator.pem")
        );
        assert_eq!(settings.supervisor_pid_file, PathBuf::from("/run/sv.pid"));
    }

    #[test]
    fn node_name_precedence() {
        let (dir, mut host) = host();
        std::fs::write(dir.path().join("zero.rb"), "").unwrap();
        let resolve_name = |cli: &Cli, host: &HostEnv| {
            resolve(cli, &InitConfig::default(), host).unwrap().client.node_name
        };

        assert_eq!(resolve_name(&parse(&["--onboot"]), &host), None);

        std::fs::write(dir.path().join(".node_name"), "from-file\n").unwrap();
        assert_eq!(resolve_name(&parse(&["--onboot"]), &host).as_deref(), Some("from-file"));

        host.node_name_env = Some("from-env".into());
        assert_eq!(resolve_name(&parse(&["--onboot"]), &host).as_deref(), Some("from-env"));

        let cli = parse(&["--onboot", "-N", "from-flag"]);
        assert_eq!(resolve_name(&cli, &host).as_deref(), Some("from-flag"));
    }

    #[test]
    fn init_config_feeds_layout_and_paths() {
        let (dir, host) = host();
        std::fs::write(dir.path().join("zero.rb"), "").unwrap();
        let init = InitConfig {
            omnibus_root: PathBuf::from("/srv/omnibus"),
            secure_directory: Some(PathBuf::from("/srv/secure")),
            supervisor_pid_file: Some(PathBuf::from("/srv/sv.pid")),
            ..InitConfig::default()
        };
        let settings = resolve(&parse(&["--onboot"]), &init, &host).unwrap();
        assert_eq!(settings.layout.root(), Path::new("/srv/omnibus"));
        assert_eq!(settings.log_pipe, PathBuf::from("/srv/omnibus/logs"));
        assert_eq!(settings.credentials.secure_dir, PathBuf::from("/srv/secure"));
        assert_eq!(settings.supervisor_pid_file, PathBuf::from("/srv/sv.pid"));

        let cli = parse(&["--onboot", "--supervisor-pid", "/cli.pid"]);
        let settings = resolve(&cli, &init, &host).unwrap();
        assert_eq!(settings.supervisor_pid_file, PathBuf::from("/cli.pid"));
    }
}
