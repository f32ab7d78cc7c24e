// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host identity reported in every payload header.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::errors::HostError;

/// Identifiers of the machine and container the process runs on.
///
/// Any field may be empty when its source is unavailable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostIdentity {
    pub boot_id: String,
    pub product_uuid: String,
    pub machine_id: String,
    pub host_id: String,
    pub hostname: String,
    pub container_id: String,
    /// Free-form details reported with host-info.
    pub details: BTreeMap<String, String>,
}

impl HostIdentity {
    /// The most specific identifier available.
    ///
    /// Resolution order is boot id, product UUID, machine id, generic host id, OS hostname, and
    /// finally the empty string.
    #[must_use]
    pub fn unique_host_id(&self) -> &str {
        [
            &self.boot_id,
            &self.product_uuid,
            &self.machine_id,
            &self.host_id,
            &self.hostname,
        ]
        .into_iter()
        .find(|id| !id.is_empty())
        .map_or("", String::as_str)
    }

    /// Best-effort detection from the running system. Never fails.
    #[must_use]
    pub fn detect() -> Self {
        Self::detect_from(&HostRoots::from_env())
    }

    #[must_use]
    pub fn detect_from(roots: &HostRoots) -> Self {
        let hostname = os_hostname();
        let mut details = BTreeMap::from([
            ("os".to_string(), std::env::consts::OS.to_string()),
            ("arch".to_string(), std::env::consts::ARCH.to_string()),
        ]);
        if let Ok(cpus) = std::thread::available_parallelism() {
            details.insert("cpus".to_string(), cpus.get().to_string());
        }
        if !hostname.is_empty() {
            details.insert("hostname".to_string(), hostname.clone());
        }

        HostIdentity {
            boot_id: tolerate("boot id", read_boot_id(roots)),
            product_uuid: tolerate("product uuid", read_product_uuid(roots)),
            machine_id: tolerate("machine id", read_machine_id(roots)),
            host_id: String::new(),
            hostname,
            container_id: tolerate("container id", read_container_id(roots)),
            details,
        }
    }
}

/// Filesystem roots host files are read from. `HOST_PROC`, `HOST_SYS` and `HOST_ETC` override the
/// defaults when the agent runs inside a container with the host mounted elsewhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostRoots {
    pub proc: PathBuf,
    pub sys: PathBuf,
    pub etc: PathBuf,
}

impl Default for HostRoots {
    fn default() -> Self {
        Self {
            proc: PathBuf::from("/proc"),
            sys: PathBuf::from("/sys"),
            etc: PathBuf::from("/etc"),
        }
    }
}

impl HostRoots {
    #[must_use]
    pub fn from_env() -> Self {
        let root = |var: &str, default: PathBuf| {
            std::env::var(var)
                .ok()
                .filter(|v| !v.is_empty())
                .map_or(default, PathBuf::from)
        };
        let defaults = Self::default();
        Self {
            proc: root("HOST_PROC", defaults.proc),
            sys: root("HOST_SYS", defaults.sys),
            etc: root("HOST_ETC", defaults.etc),
        }
    }
}

fn tolerate(what: &str, result: Result<String, HostError>) -> String {
    result.unwrap_or_else(|e| {
        debug!("HOST | {what} unavailable: {e}");
        String::new()
    })
}

fn read_first_line(path: &Path) -> Result<String, HostError> {
    let content = fs::read_to_string(path).map_err(|source| HostError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let line = content.lines().next().unwrap_or_default().trim();
    if line.is_empty() {
        return Err(HostError::Empty(path.display().to_string()));
    }
    Ok(line.to_string())
}

fn read_boot_id(roots: &HostRoots) -> Result<String, HostError> {
    read_first_line(&roots.proc.join("sys/kernel/random/boot_id")).map(|id| id.to_lowercase())
}

fn read_product_uuid(roots: &HostRoots) -> Result<String, HostError> {
    read_first_line(&roots.sys.join("class/dmi/id/product_uuid")).map(|id| id.to_lowercase())
}

/// The 32 hex digit machine id, rendered in UUID form.
fn read_machine_id(roots: &HostRoots) -> Result<String, HostError> {
    let path = roots.etc.join("machine-id");
    let id = read_first_line(&path)?;
    if id.len() != 32 || !id.is_ascii() {
        return Err(HostError::Empty(path.display().to_string()));
    }
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &id[0..8],
        &id[8..12],
        &id[12..16],
        &id[16..20],
        &id[20..32]
    ))
}

fn read_container_id(roots: &HostRoots) -> Result<String, HostError> {
    let path = roots.proc.join("self/cgroup");
    let content = fs::read_to_string(&path).map_err(|source| HostError::Read {
        path: path.display().to_string(),
        source,
    })?;
    container_id_from_cgroup(&content).ok_or_else(|| HostError::Empty(path.display().to_string()))
}

/// Finds the container id in `/proc/self/cgroup`, preferring the `cpu` controller line.
fn container_id_from_cgroup(content: &str) -> Option<String> {
    static CPU_LINE: OnceLock<Option<Regex>> = OnceLock::new();
    static CONTAINER_ID: OnceLock<Option<Regex>> = OnceLock::new();
    let cpu_line = CPU_LINE
        .get_or_init(|| Regex::new(r"^\d+:[^:]*?\bcpu\b[^:]*:").ok())
        .as_ref()?;
    let container_id = CONTAINER_ID
        .get_or_init(|| Regex::new(r"[0-9a-f]{64}").ok())
        .as_ref()?;

    let find_in = |line: &str| {
        let path = line.splitn(3, ':').nth(2)?;
        container_id.find(path).map(|m| m.as_str().to_string())
    };

    content
        .lines()
        .find(|line| cpu_line.is_match(line))
        .and_then(find_in)
        // cgroup v2 has a single unified hierarchy line.
        .or_else(|| content.lines().filter(|l| l.starts_with("0::")).find_map(find_in))
}

fn os_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_str().map(str::to_string).unwrap_or_default(),
        Err(e) => {
            debug!("HOST | failed to read OS hostname: {e}");
            String::new()
        }
    }
}
