use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=GIT_TAG");
    println!("cargo:rerun-if-env-changed=GIT_HASH");

    let tag = env_or_git("GIT_TAG", &["describe", "--tags", "--abbrev=0"])
        .unwrap_or_else(|| "untagged".to_string());
    let hash = env_or_git("GIT_HASH", &["rev-parse", "--short=12", "HEAD"])
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GITVAULT_GIT_TAG={tag}");
    println!("cargo:rustc-env=GITVAULT_GIT_HASH={hash}");
}

fn env_or_git(var: &str, args: &[&str]) -> Option<String> {
    if let Ok(value) = std::env::var(var)
        && !value.trim().is_empty()
    {
        return Some(value.trim().to_string());
    }
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}
