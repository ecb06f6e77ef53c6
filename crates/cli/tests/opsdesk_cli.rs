use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::process::{Command, Output};

fn write_file(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dir");
    }
    fs::write(path, body).expect("write file");
}

fn run(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_opsdesk"))
        .args(args)
        .env("HOME", home)
        .env("NO_COLOR", "1")
        .env_remove("OPSDESK_CONFIG")
        .env_remove("OPSDESK_TOKEN")
        .env_remove("RUST_LOG")
        .output()
        .expect("run opsdesk")
}

/// A local port with nothing listening on it.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

#[test]
fn help_lists_subcommands() {
    let home = tempfile::tempdir().expect("tempdir");
    let output = run(home.path(), &["--help"]);
    assert!(output.status.success(), "help should succeed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["ask", "chat", "clarify", "config"] {
        assert!(stdout.contains(command), "missing {command}: {stdout}");
    }
}

#[test]
fn config_defaults_then_update() {
    let home = tempfile::tempdir().expect("tempdir");

    let output = run(home.path(), &["config"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("(not found, using defaults)"), "{stdout}");
    assert!(stdout.contains("http://localhost:8000"), "{stdout}");

    let output = run(
        home.path(),
        &["config", "--server", "https://agent.internal", "--token", "secret-token-1"],
    );
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("https://agent.internal"), "{stdout}");
    assert!(stdout.contains("secret-t..."), "{stdout}");
    assert!(!stdout.contains("secret-token-1"), "token must be masked");

    let saved = fs::read_to_string(home.path().join(".config/opsdesk/opsdesk.toml"))
        .expect("config written");
    assert!(saved.contains("https://agent.internal"));
}

#[test]
fn clarify_with_defaults_prints_composed_prompt() {
    let home = tempfile::tempdir().expect("tempdir");
    let dir = home.path().join("data");
    write_file(
        &dir.join("catalog.json"),
        r#"{"clarifications": {"currency": {
            "module": "Purchasing",
            "user_question": "create purchase order currency",
            "clarification_question": "Which currency?",
            "selector": {"kind": "single_select"},
            "options": [
                {"value": "EUR", "display_value": "EUR"},
                {"value": "USD", "display_value": "USD"}
            ],
            "keyword_hints": ["currency"],
            "context_tags": ["currency"]
        }}}"#,
    );
    write_file(
        &dir.join("defaults.json"),
        r#"[{"query_id": "config_currencies", "rows": [
            {"symbol": "EUR", "isbasecurrency": "F"},
            {"symbol": "USD", "isbasecurrency": "T"}
        ]}]"#,
    );
    let config = dir.join("opsdesk.toml");
    write_file(
        &config,
        &format!(
            "[clarifications]\nmode = \"local\"\ncatalog_path = \"{}\"\nsystem_defaults_path = \"{}\"\n",
            dir.join("catalog.json").display(),
            dir.join("defaults.json").display()
        ),
    );

    let output = run(
        home.path(),
        &[
            "clarify",
            "--config",
            config.to_str().expect("utf-8 path"),
            "-y",
            "create purchase order currency",
        ],
    );
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("create purchase order currency\n\nClarified context:\n- Currency: USD"),
        "{stdout}"
    );
}

#[test]
fn ask_against_unreachable_server_fails() {
    let home = tempfile::tempdir().expect("tempdir");
    let config = home.path().join("opsdesk.toml");
    write_file(
        &config,
        &format!(
            "[server]\nurl = \"http://127.0.0.1:{}\"\n\n[clarifications]\nmode = \"local\"\n",
            closed_port()
        ),
    );

    let output = run(
        home.path(),
        &["ask", "--config", config.to_str().expect("utf-8 path"), "hello there"],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error: run failed"), "{stderr}");
}
