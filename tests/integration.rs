use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn tmig_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("tmig");
    path
}

fn setup_test_env(base_url: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let input_dir = root.join("export");
    fs::create_dir_all(&input_dir).unwrap();

    fs::write(
        input_dir.join("report-users.csv"),
        "count,id,login,name,email\n4,u1,alice,Alice Smith,alice@corp.com\n",
    )
    .unwrap();
    fs::write(
        input_dir.join("tickets.csv"),
        "id,number,summary,description,reporter_id,status,created_on\n\
         t1,1,First,Body,u1,New,2014-01-01 00:00:00\n\
         t2,2,Second,See #1,u1,Done,2014-01-02 00:00:00\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[target]
base_url = "{base_url}"

[source]
space = "Europeana APIs"
tickets_url = "https://app.assembla.com/spaces/europeana-apis/tickets"
input_dir = "{root}/export"

[output]
dir = "{root}/out"
state_db = "{root}/data/state.sqlite"

[project]
name = "Europeana APIs"
key = "EA"

[accounts]
admin_account_id = "admin"
fallback_account_id = "fallback"
"#,
        base_url = base_url,
        root = root.display()
    );

    let config_path = config_dir.join("tmig.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_tmig(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = tmig_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("JIRA_API_USERNAME", "migrator@example.org")
        .env("JIRA_API_TOKEN", "secret")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run tmig binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("https://example.atlassian.net");

    let (stdout, stderr, success) = run_tmig(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/state.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("https://example.atlassian.net");

    let (_, _, success1) = run_tmig(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_tmig(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_sources() {
    let (_tmp, config_path) = setup_test_env("https://example.atlassian.net");

    let (stdout, stderr, success) = run_tmig(&config_path, &["sources"]);
    assert!(success, "sources failed: {}", stderr);
    assert!(stdout.contains("TABLE"));
    let tickets = stdout.lines().find(|l| l.starts_with("tickets.csv")).unwrap();
    assert!(tickets.contains("OK"));
    assert!(tickets.contains(" 2 "));
    let comments = stdout
        .lines()
        .find(|l| l.starts_with("ticket-comments.csv"))
        .unwrap();
    assert!(comments.contains("MISSING (comments)"));
}

#[test]
fn test_stats_before_any_run() {
    let (_tmp, config_path) = setup_test_env("https://example.atlassian.net");

    let (stdout, stderr, success) = run_tmig(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("jira-tickets.csv"));
    assert!(!stdout.contains("Recent runs"));
}

#[test]
fn test_missing_config() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_tmig(&tmp.path().join("nope.toml"), &["sources"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_unknown_pass() {
    let (_tmp, config_path) = setup_test_env("https://example.atlassian.net");

    let (_, stderr, success) = run_tmig(&config_path, &["run", "milestones"]);
    assert!(!success);
    assert!(stderr.contains("Unknown pass 'milestones'"));
}

#[test]
fn test_run_requires_credentials() {
    let (_tmp, config_path) = setup_test_env("https://example.atlassian.net");

    let output = Command::new(tmig_binary())
        .arg("--config")
        .arg(&config_path)
        .args(["run", "projects"])
        .env_remove("JIRA_API_USERNAME")
        .env_remove("JIRA_API_TOKEN")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("JIRA_API_USERNAME and JIRA_API_TOKEN"));
}

#[test]
fn test_tickets_before_projects_fails() {
    let (_tmp, config_path) = setup_test_env("https://example.atlassian.net");

    let (_, stderr, success) = run_tmig(&config_path, &["run", "tickets", "--dry-run"]);
    assert!(!success);
    assert!(stderr.contains("run the 'projects' pass first"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_projects_dry_run_then_create() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/api/2/project"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/api/2/project"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(serde_json::json!({"id": "10000", "key": "EA"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    let (tmp, config_path) = setup_test_env(&server.uri());

    let (stdout, stderr, success) = run_tmig(&config_path, &["run", "projects", "--dry-run"]);
    assert!(success, "dry run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("run projects (dry-run)"));
    assert!(stdout.contains("would create project EA (Europeana APIs)"));
    assert!(!tmp.path().join("out/jira-projects.csv").exists());

    let (stdout, stderr, success) = run_tmig(&config_path, &["run", "projects"]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("  ok: 1"));
    let log = fs::read_to_string(tmp.path().join("out/jira-projects.csv")).unwrap();
    assert!(log.contains("OK,,10000,EA,Europeana APIs,true"));

    let (stdout, _, success) = run_tmig(&config_path, &["stats", "--pass", "projects"]);
    assert!(success);
    assert!(stdout.contains("Recent runs"));
    assert!(stdout.contains("(dry-run)"));
}
