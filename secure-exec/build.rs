use std::env;
use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=crates/python-sandbox/src");
    println!("cargo:rerun-if-changed=../.git/HEAD");

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let project_root = Path::new(&manifest_dir)
        .parent()
        .unwrap_or_else(|| Path::new("."));

    set_git_version_info(project_root);
}

fn git_output(project_root: &Path, args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .current_dir(project_root)
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout).ok().map(|s| s.trim().to_string())
            } else {
                None
            }
        })
}

/// Export the commit count and short hash for `secure-exec probe`
fn set_git_version_info(project_root: &Path) {
    let commit_count = git_output(project_root, &["rev-list", "--count", "HEAD"])
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);

    let git_hash = git_output(project_root, &["rev-parse", "--short", "HEAD"])
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=SECURE_EXEC_GIT_COUNT={}", commit_count);
    println!("cargo:rustc-env=SECURE_EXEC_GIT_HASH={}", git_hash);
}
