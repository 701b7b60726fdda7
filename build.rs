// Embed git hash for --version. Optional; no git = no hash.
fn main() {
    if let Ok(output) = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
    {
        if output.status.success() {
            if let Ok(s) = String::from_utf8(output.stdout) {
                let hash = s.trim();
                let version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
                println!("cargo:rustc-env=PTM_LONG_VERSION={version} ({hash})");
            }
        }
    }
}
