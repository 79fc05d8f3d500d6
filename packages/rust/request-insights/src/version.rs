//! Build/version identifier recorded as the `committish` property.
//!
//! The identifier is resolved once, when the layer is built, and then shared
//! by every request. `APPINSIGHTS_BUILD_VERSION` overrides whatever source was
//! configured in code.

use crate::constants::{defaults, env_vars};
use crate::logger::Logger;
use std::env;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

static LOGGER: Logger = Logger::const_new("version");

static GIT_DESCRIBE: OnceLock<Option<String>> = OnceLock::new();

/// Where the build identifier comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VersionSource {
    /// A fixed identifier, typically `env!("CARGO_PKG_VERSION")` or a CI-provided sha.
    Static(String),
    /// Output of `git describe --always --abbrev=8` in the working directory.
    GitDescribe,
    /// No identifier; `committish` is recorded as null.
    #[default]
    Disabled,
}

impl VersionSource {
    /// Resolve the identifier. The environment override wins over the source.
    /// Empty results are reported as `None`.
    pub fn resolve(&self) -> Option<String> {
        if let Some(version) = env::var(env_vars::BUILD_VERSION)
            .ok()
            .filter(|v| !v.trim().is_empty())
        {
            return Some(version.trim().to_string());
        }

        match self {
            VersionSource::Static(version) => {
                Some(version.trim().to_string()).filter(|v| !v.is_empty())
            }
            VersionSource::GitDescribe => GIT_DESCRIBE
                .get_or_init(|| git_describe(defaults::VERSION_LOOKUP_TIMEOUT))
                .clone(),
            VersionSource::Disabled => None,
        }
    }
}

fn git_describe(timeout: Duration) -> Option<String> {
    let mut child = match Command::new("git")
        .args(["describe", "--always", "--abbrev=8"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            LOGGER.debug(format!("VersionSource.resolve: git unavailable: {}", e));
            return None;
        }
    };

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if started.elapsed() >= timeout => {
                LOGGER.warn(format!(
                    "VersionSource.resolve: git describe did not finish within {:?}",
                    timeout
                ));
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            Ok(None) => thread::sleep(Duration::from_millis(10)),
            Err(e) => {
                LOGGER.warn(format!("VersionSource.resolve: git describe failed: {}", e));
                return None;
            }
        }
    }

    let output = match child.wait_with_output() {
        Ok(output) if output.status.success() => output,
        Ok(_) => return None,
        Err(e) => {
            LOGGER.warn(format!("VersionSource.resolve: git describe failed: {}", e));
            return None;
        }
    };

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!version.is_empty()).then_some(version)
}
