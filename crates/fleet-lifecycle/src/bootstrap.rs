//! Host bootstrap: the one-time host-init actions of a domain.
//!
//! A host counts as bootstrapped for a domain once the marker file
//! `<remote_root>/.bootstrap/<domain>-<host_init digest>` exists on it.
//! Changing a role's host-init therefore re-runs bootstrap once.

use fleet_core::HostInit;
use fleet_transport::shell;

pub fn marker_dir(remote_root: &str) -> String {
    format!("{remote_root}/.bootstrap")
}

pub fn marker_path(remote_root: &str, domain: &str, host_init: &HostInit) -> String {
    format!("{}/{domain}-{}", marker_dir(remote_root), host_init.digest())
}

/// Directory receiving prefetched packages.
pub fn package_dir(remote_root: &str) -> String {
    format!("{remote_root}/packages")
}

/// Shell commands performing the host-init actions, in order.
pub fn steps(remote_root: &str, host_init: &HostInit) -> Vec<String> {
    let mut steps = Vec::new();
    if !host_init.mounts.is_empty() {
        steps.push(format!("mkdir -p {}", shell::join(&host_init.mounts)));
    }
    if !host_init.packages.is_empty() {
        let dir = package_dir(remote_root);
        steps.push(format!("mkdir -p {}", shell::quote(&dir)));
        for url in &host_init.packages {
            let name = url
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .unwrap_or("package");
            steps.push(format!(
                "curl -fsSL -o {} {}",
                shell::quote(&format!("{dir}/{name}")),
                shell::quote(url)
            ));
        }
    }
    steps.extend(host_init.commands.iter().cloned());
    steps
}
