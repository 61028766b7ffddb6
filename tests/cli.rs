use std::io::Write;
use std::process::Command;

fn bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_aelkey"));
    // CI containers may run as root.
    cmd.env("AELKEY_ALLOW_ROOT", "1");
    cmd
}

#[test]
fn version_flag_prints_version() {
    let output = bin().arg("-V").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn missing_script_fails_with_exit_code_one() {
    let output = bin().arg("/nonexistent/script.lua").output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn script_errors_fail_with_exit_code_one() {
    let mut file = tempfile_path("bad");
    writeln!(file.1, "this is not lua").unwrap();
    let output = bin().arg(&file.0).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    std::fs::remove_file(&file.0).ok();
}

#[test]
fn trivial_script_exits_cleanly() {
    let mut file = tempfile_path("ok");
    writeln!(file.1, r#"local aelkey = require("aelkey")"#).unwrap();
    let output = bin().arg(&file.0).output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    std::fs::remove_file(&file.0).ok();
}

fn tempfile_path(tag: &str) -> (std::path::PathBuf, std::fs::File) {
    let path = std::env::temp_dir().join(format!(
        "aelkey-test-{tag}-{}.lua",
        std::process::id()
    ));
    let file = std::fs::File::create(&path).unwrap();
    (path, file)
}
