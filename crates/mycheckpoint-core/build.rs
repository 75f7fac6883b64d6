use std::process::Command;

/// `git describe` of the checkout, e.g. `a1b2c3d-dirty`.
fn describe() -> Option<String> {
    let out = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=10"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let id = String::from_utf8(out.stdout).ok()?;
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn main() {
    // Packagers building from a tarball pass the id in.
    let build = std::env::var("MYCHECKPOINT_BUILD")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(describe)
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=MYCHECKPOINT_BUILD={build}");

    println!("cargo:rerun-if-env-changed=MYCHECKPOINT_BUILD");
    for path in ["../../.git/HEAD", "../../.git/index"] {
        println!("cargo:rerun-if-changed={path}");
    }
}
