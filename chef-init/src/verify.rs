//! `chef-init --verify`: installation smoke test.

use std::path::Path;

use init_common::Layout;
use pid1::command;
use pid1::{CommandSpec, ProcessRegistry};
use tracing::{error, info};

const REQUIRED_BINARIES: [&str; 4] = ["runsvdir", "sv", "chef-init", "chef-client"];
const VERSIONED_BINARIES: [&str; 2] = ["chef-init", "chef-client"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct Report {
    pub checks: Vec<Check>,
}

impl Report {
    pub fn passed(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn total(&self) -> usize {
        self.checks.len()
    }

    pub fn success(&self) -> bool {
        self.passed() == self.total()
    }

    pub fn summary(&self) -> String {
        format!("{}/{} tests passed", self.passed(), self.total())
    }

    fn record(&mut self, name: String, passed: bool, detail: String) {
        if passed {
            info!("{name}: pass");
        } else {
            error!("{name}: fail ({detail})");
        }
        self.checks.push(Check {
            name,
            passed,
            detail,
        });
    }
}

/// Check the omnibus binaries are installed and runnable.
pub async fn verify(layout: &Layout, registry: &ProcessRegistry) -> Report {
    let search_path = layout.search_path();
    let mut report = Report::default();

    for bin in REQUIRED_BINARIES {
        let (passed, detail) = match which::which_in(bin, Some(&search_path), Path::new("/")) {
            Ok(path) => (true, path.display().to_string()),
            Err(e) => (false, format!("{bin} not found: {e}")),
        };
        report.record(format!("{bin} exists"), passed, detail);
    }

    for bin in VERSIONED_BINARIES {
        let spec = CommandSpec::new(bin)
            .arg("--version")
            .env("PATH", search_path.clone());
        let (passed, detail) = match command::exec(registry, spec).await {
            Ok(output) if output.status.success() => (true, output.stdout.trim().to_string()),
            Ok(output) => (false, format!("{bin} --version: {}", output.status)),
            Err(e) => (false, e.to_string()),
        };
        report.record(format!("{bin} --version"), passed, detail);
    }

    report
}
