use assert_cmd::Command;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use tempfile::tempdir;

fn quadplay(config_home: &std::path::Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("quadplay"));
    cmd.env("XDG_CONFIG_HOME", config_home)
        .env_remove("MY_QUADPLAY")
        .env_remove("QUADPLAY_PORT")
        .env_remove("QUADPLAY_ROOT");
    cmd
}

#[test]
fn help_lists_launch_flags() {
    let dir = tempdir().expect("tempdir should work");
    quadplay(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("--my-quadplay"))
        .stdout(contains("--kiosk"))
        .stdout(contains("--listen-child").not());
}

#[test]
fn version_flag_prints_name() {
    let dir = tempdir().expect("tempdir should work");
    quadplay(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("quadplay"));
}

#[test]
fn relative_library_is_rejected() {
    let dir = tempdir().expect("tempdir should work");
    quadplay(dir.path())
        .args(["--quadpath", dir.path().to_str().expect("path utf8")])
        .args(["--my-quadplay", "relative/games"])
        .assert()
        .failure()
        .stderr(contains("absolute"));
}

#[test]
fn library_with_spaces_is_rejected() {
    let dir = tempdir().expect("tempdir should work");
    let library = dir.path().join("my games");
    quadplay(dir.path())
        .args(["--quadpath", dir.path().to_str().expect("path utf8")])
        .args(["--my-quadplay", library.to_str().expect("path utf8")])
        .assert()
        .failure()
        .stderr(contains("may not contain spaces"));
}

#[test]
fn missing_custom_library_is_fatal() {
    let dir = tempdir().expect("tempdir should work");
    let library = dir.path().join("absent");
    quadplay(dir.path())
        .args(["--quadpath", dir.path().to_str().expect("path utf8")])
        .args(["--my-quadplay", library.to_str().expect("path utf8")])
        .assert()
        .failure()
        .stderr(contains("does not exist"));
    assert!(!library.exists());
}

#[test]
fn malformed_config_file_is_reported() {
    let dir = tempdir().expect("tempdir should work");
    let config = dir.path().join("server.json");
    std::fs::write(&config, r#"{"colour": "blue"}"#).expect("write should work");
    quadplay(dir.path())
        .args(["--config", config.to_str().expect("path utf8")])
        .assert()
        .failure()
        .stderr(contains("unknown field"));
}
