use std::{
    env,
    process::Command,
    time::{SystemTime, UNIX_EPOCH},
};

const VERSION_OVERRIDE: &str = "REQAUTH_BUILD_VERSION";

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-env-changed={VERSION_OVERRIDE}");

    let version = env::var(VERSION_OVERRIDE)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(git_version)
        .unwrap_or_else(package_version);

    println!("cargo:rustc-env=REQAUTH_VERSION={version}");
}

/// `git describe` output without a leading `v`. Dirty trees get a build stamp
/// so two local builds never report the same version.
fn git_version() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())?;
    let described = String::from_utf8(output.stdout).ok()?;
    let described = described.trim();
    let described = described.strip_prefix('v').unwrap_or(described);

    match described {
        "" => None,
        d if d.ends_with("-dirty") => Some(format!("{d}.{}", build_stamp())),
        d => Some(d.to_string()),
    }
}

/// Used outside a git checkout, e.g. when building from a published tarball.
fn package_version() -> String {
    let base = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
    format!("{base}+build.{}", build_stamp())
}

fn build_stamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
