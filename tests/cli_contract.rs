use std::fs;
use std::path::Path;
use std::process::Command;

use serde_json::Value;
use tempfile::tempdir;

fn write_lrgb(path: &Path, width: usize, height: usize) {
    let mut bytes = format!(
        "PTM_1.2\nPTM_FORMAT_LRGB\n{width} {height}\n1 1 1 1 1 1\n0 0 0 0 0 0\n"
    )
    .into_bytes();
    for pixel in 0..width * height {
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 100 + (pixel % 100) as u8]);
    }
    bytes.extend(std::iter::repeat(200).take(width * height * 3));
    fs::write(path, bytes).expect("ptm should write");
}

fn run_ptm(cwd: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_ptm"))
        .current_dir(cwd)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("ptm command should run")
}

#[test]
fn inspect_json_reports_header_fields() {
    let dir = tempdir().expect("tempdir should create");
    write_lrgb(&dir.path().join("scene.ptm"), 3, 2);

    let output = run_ptm(dir.path(), &["inspect", "scene.ptm", "--json"]);
    assert!(
        output.status.success(),
        "inspect --json should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report: Value = serde_json::from_slice(&output.stdout).expect("stdout should be json");
    assert_eq!(report["version"], "PTM_1.2");
    assert_eq!(report["format"], "luminance_rgb");
    assert_eq!(report["width"], 3);
    assert_eq!(report["height"], 2);
    assert_eq!(report["coefficient_planes"], 6);
    assert_eq!(report["has_base_color"], true);
    assert_eq!(report["bias"].as_array().map(Vec::len), Some(6));
}

#[test]
fn inspect_text_summary_names_the_format() {
    let dir = tempdir().expect("tempdir should create");
    write_lrgb(&dir.path().join("scene.ptm"), 2, 2);

    let output = run_ptm(dir.path(), &["inspect", "scene.ptm"]);
    assert!(output.status.success(), "inspect should succeed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2x2"), "unexpected summary: {stdout}");
    assert!(stdout.contains("PTM_FORMAT_LRGB"), "unexpected summary: {stdout}");
}

#[test]
fn software_render_writes_png_of_requested_size() {
    let dir = tempdir().expect("tempdir should create");
    write_lrgb(&dir.path().join("scene.ptm"), 4, 4);

    let output = run_ptm(
        dir.path(),
        &[
            "render",
            "scene.ptm",
            "-o",
            "out.png",
            "--software",
            "--width",
            "8",
            "--height",
            "6",
            "--light-u",
            "-0.25",
            "--mode",
            "specular",
        ],
    );
    assert!(
        output.status.success(),
        "render --software should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Wrote out.png"));

    let image = image::open(dir.path().join("out.png"))
        .expect("png should decode")
        .to_rgba8();
    assert_eq!(image.dimensions(), (8, 6));
}

#[test]
fn settings_file_drives_render_and_flags_override_it() {
    let dir = tempdir().expect("tempdir should create");
    write_lrgb(&dir.path().join("scene.ptm"), 2, 2);
    fs::write(
        dir.path().join("preset.yaml"),
        "light: { u: 0.2, v: 0.1 }\nmode: 17\noutput: { width: 5, height: 3 }\n",
    )
    .expect("settings should write");

    let magenta = run_ptm(
        dir.path(),
        &["render", "scene.ptm", "-o", "a.png", "--software", "--settings", "preset.yaml"],
    );
    assert!(magenta.status.success(), "preset render should succeed");
    let image = image::open(dir.path().join("a.png"))
        .expect("png should decode")
        .to_rgba8();
    assert_eq!(image.dimensions(), (5, 3));
    assert!(image.pixels().all(|pixel| pixel.0 == [255, 0, 255, 255]));

    let overridden = run_ptm(
        dir.path(),
        &[
            "render",
            "scene.ptm",
            "-o",
            "b.png",
            "--software",
            "--settings",
            "preset.yaml",
            "--mode",
            "default",
            "--width",
            "2",
        ],
    );
    assert!(overridden.status.success(), "override render should succeed");
    let image = image::open(dir.path().join("b.png"))
        .expect("png should decode")
        .to_rgba8();
    assert_eq!(image.dimensions(), (2, 3));
    assert!(image.pixels().all(|pixel| pixel.0 != [255, 0, 255, 255]));
}

#[test]
fn unsupported_version_fails_with_message() {
    let dir = tempdir().expect("tempdir should create");
    fs::write(dir.path().join("old.ptm"), b"PTM_1.1\nPTM_FORMAT_LRGB\n").expect("ptm should write");

    let output = run_ptm(dir.path(), &["inspect", "old.ptm"]);
    assert!(!output.status.success(), "old version should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("unsupported PTM version 'PTM_1.1'"),
        "unexpected stderr: {stderr}"
    );
}

#[test]
fn invalid_settings_are_rejected_before_decoding() {
    let dir = tempdir().expect("tempdir should create");
    write_lrgb(&dir.path().join("scene.ptm"), 1, 1);

    let output = run_ptm(
        dir.path(),
        &["render", "scene.ptm", "-o", "out.png", "--software", "--diffuse-gain", "0"],
    );
    assert!(!output.status.success(), "zero gain should fail");
    assert!(String::from_utf8_lossy(&output.stderr).contains("diffuse_gain"));
    assert!(!dir.path().join("out.png").exists());
}
