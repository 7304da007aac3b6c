//! Integration tests for sched-queue commands

use assert_cmd::Command;
use chrono::{DateTime, Duration, Utc};
use libschedcast::{Claim, Database, Post, PostStatus, PostStore};
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const UUID_PATTERN: &str = r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";

/// Helper to escape path for TOML on Windows
fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

/// Helper to create a test environment with config and database
fn setup_test_env() -> (TempDir, String, String) {
    let temp_dir = TempDir::new().unwrap();

    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("data").join("posts.db");

    let config_content = format!(
        r#"
[database]
path = "{}"

[platforms]
enabled = ["twitter", "facebook"]
"#,
        escape_path_for_toml(&db_path.to_string_lossy())
    );
    fs::write(&config_path, config_content).unwrap();

    (
        temp_dir,
        config_path.to_string_lossy().to_string(),
        db_path.to_string_lossy().to_string(),
    )
}

fn queue(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("sched-queue").unwrap();
    cmd.env("SCHEDCAST_CONFIG", config_path)
        .env_remove("SCHEDCAST_DB_PATH")
        .env_remove("SCHEDCAST_LOG_LEVEL");
    cmd
}

/// Run `add` and return the printed post id
fn add_post(config_path: &str, content: &str, platforms: &str, at: &str) -> String {
    let output = queue(config_path)
        .args(["add", content, "-p", platforms, "--at", at])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    String::from_utf8(output).unwrap().trim().to_string()
}

async fn seed_post(db_path: &str, content: &str, at: DateTime<Utc>) -> String {
    let db = Database::new(db_path).await.unwrap();
    let post = Post::new(content.to_string(), ["twitter"], at).unwrap();
    db.create(&post).await.unwrap()
}

async fn load_post(db_path: &str, post_id: &str) -> Post {
    let db = Database::new(db_path).await.unwrap();
    db.get(post_id).await.unwrap().unwrap()
}

// ADD

#[tokio::test]
async fn test_add_prints_id_and_persists() {
    let (_temp_dir, config_path, db_path) = setup_test_env();

    let post_id = add_post(&config_path, "Launch day!", "Twitter,facebook", "2h");
    assert!(predicate::str::is_match(UUID_PATTERN).unwrap().eval(&post_id));

    let post = load_post(&db_path, &post_id).await;
    assert_eq!(post.content, "Launch day!");
    assert_eq!(post.platforms, vec!["twitter", "facebook"]);
    assert_eq!(post.status, PostStatus::Pending);

    let minutes = (post.scheduled_at - Utc::now()).num_minutes();
    assert!((118..=120).contains(&minutes), "got {} minutes", minutes);
}

#[tokio::test]
async fn test_add_reads_content_from_stdin() {
    let (_temp_dir, config_path, db_path) = setup_test_env();

    let output = queue(&config_path)
        .args(["add", "-p", "twitter", "--media", "https://cdn.example.com/cat.gif"])
        .write_stdin("From a pipe\n")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let post_id = String::from_utf8(output).unwrap().trim().to_string();

    let post = load_post(&db_path, &post_id).await;
    assert_eq!(post.content, "From a pipe");
    assert_eq!(post.media_url.as_deref(), Some("https://cdn.example.com/cat.gif"));
}

#[tokio::test]
async fn test_add_rejects_bad_time() {
    let (_temp_dir, config_path, _db_path) = setup_test_env();

    queue(&config_path)
        .args(["add", "hello", "-p", "twitter", "--at", "someday maybe"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Could not parse schedule"));
}

#[tokio::test]
async fn test_add_rejects_empty_content() {
    let (_temp_dir, config_path, _db_path) = setup_test_env();

    queue(&config_path)
        .args(["add", "   ", "-p", "twitter"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Content cannot be empty"));
}

// LIST

#[tokio::test]
async fn test_list_empty_queue() {
    let (_temp_dir, config_path, _db_path) = setup_test_env();

    queue(&config_path)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[tokio::test]
async fn test_list_ordered_by_scheduled_time() {
    let (_temp_dir, config_path, db_path) = setup_test_env();
    let now = Utc::now();
    seed_post(&db_path, "Scheduled post 3", now + Duration::hours(3)).await;
    seed_post(&db_path, "Scheduled post 1", now + Duration::hours(1)).await;
    seed_post(&db_path, "Scheduled post 2", now + Duration::hours(2)).await;

    let output = queue(&config_path)
        .arg("list")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(output).unwrap();

    let pos1 = stdout.find("Scheduled post 1").unwrap();
    let pos2 = stdout.find("Scheduled post 2").unwrap();
    let pos3 = stdout.find("Scheduled post 3").unwrap();
    assert!(pos1 < pos2, "Posts should be ordered by scheduled time");
    assert!(pos2 < pos3, "Posts should be ordered by scheduled time");
    assert!(stdout.contains("in 59m") || stdout.contains("in 1h 0m"));
}

#[tokio::test]
async fn test_list_json_format() {
    let (_temp_dir, config_path, _db_path) = setup_test_env();
    let post_id = add_post(&config_path, "JSON me", "facebook", "30m");

    let output = queue(&config_path)
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let posts: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let posts = posts.as_array().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["id"], post_id.as_str());
    assert_eq!(posts[0]["status"], "pending");
    assert_eq!(posts[0]["platforms"][0], "facebook");
    assert!(posts[0]["scheduled_at"].is_string());
}

#[tokio::test]
async fn test_list_json_format_empty() {
    let (_temp_dir, config_path, _db_path) = setup_test_env();

    queue(&config_path)
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::eq("[]\n"));
}

#[tokio::test]
async fn test_list_status_filter() {
    let (_temp_dir, config_path, db_path) = setup_test_env();
    let kept = add_post(&config_path, "Still pending", "twitter", "1h");
    let cancelled = add_post(&config_path, "Called off", "twitter", "1h");
    Database::new(&db_path)
        .await
        .unwrap()
        .cancel(&cancelled)
        .await
        .unwrap();

    queue(&config_path)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains(&kept))
        .stdout(predicate::str::contains(&cancelled).not());

    queue(&config_path)
        .args(["list", "--status", "cancelled"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&cancelled))
        .stdout(predicate::str::contains(&kept).not());

    queue(&config_path)
        .args(["list", "--status", "all"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&cancelled))
        .stdout(predicate::str::contains(&kept));
}

#[tokio::test]
async fn test_list_filter_by_platform() {
    let (_temp_dir, config_path, _db_path) = setup_test_env();
    let tweet = add_post(&config_path, "Tweet only", "twitter", "1h");
    let both = add_post(&config_path, "Everywhere", "twitter,facebook", "1h");

    queue(&config_path)
        .args(["list", "--platform", "Facebook"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&both))
        .stdout(predicate::str::contains(&tweet).not());
}

#[tokio::test]
async fn test_list_invalid_arguments() {
    let (_temp_dir, config_path, _db_path) = setup_test_env();

    queue(&config_path)
        .args(["list", "--format", "xml"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Invalid format 'xml'"));

    queue(&config_path)
        .args(["list", "--status", "archived"])
        .assert()
        .failure()
        .code(3);
}

// SHOW

#[tokio::test]
async fn test_show_text_and_json() {
    let (_temp_dir, config_path, _db_path) = setup_test_env();
    let post_id = add_post(&config_path, "Look at me", "twitter", "2025-01-01 09:30");

    queue(&config_path)
        .args(["show", &post_id])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("ID:         {}", post_id)))
        .stdout(predicate::str::contains("Status:     pending"))
        .stdout(predicate::str::contains("2025-01-01T09:30:00+00:00"))
        .stdout(predicate::str::contains("Look at me"));

    let output = queue(&config_path)
        .args(["show", &post_id, "--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let post: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(post["content"], "Look at me");
    assert_eq!(post["posted_at"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_show_unknown_post() {
    let (_temp_dir, config_path, _db_path) = setup_test_env();

    queue(&config_path)
        .args(["show", "does-not-exist"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Post not found: does-not-exist"));
}

// CANCEL

#[tokio::test]
async fn test_cancel_pending_post() {
    let (_temp_dir, config_path, db_path) = setup_test_env();
    let post_id = add_post(&config_path, "Never mind", "twitter", "1h");

    queue(&config_path)
        .args(["cancel", &post_id])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Cancelled {}", post_id)));

    assert_eq!(load_post(&db_path, &post_id).await.status, PostStatus::Cancelled);

    // Terminal: a second cancel is rejected
    queue(&config_path)
        .args(["cancel", &post_id])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no longer pending"));
}

#[tokio::test]
async fn test_cancel_unknown_post() {
    let (_temp_dir, config_path, _db_path) = setup_test_env();

    queue(&config_path)
        .args(["cancel", "nope"])
        .assert()
        .failure()
        .code(3);
}

#[tokio::test]
async fn test_cancel_posted_post_is_rejected() {
    let (_temp_dir, config_path, db_path) = setup_test_env();
    let post_id = seed_post(&db_path, "Already out", Utc::now()).await;
    let db = Database::new(&db_path).await.unwrap();
    let Claim::Acquired(token) = db.claim(&post_id, None, Utc::now()).await.unwrap() else {
        panic!("Expected to claim the post");
    };
    db.finish(&post_id, &token, PostStatus::Posted, Utc::now())
        .await
        .unwrap();

    queue(&config_path)
        .args(["cancel", &post_id])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("status: posted"));

    assert_eq!(load_post(&db_path, &post_id).await.status, PostStatus::Posted);
}

#[tokio::test]
async fn test_cancel_and_reschedule_rejected_while_publishing() {
    let (_temp_dir, config_path, db_path) = setup_test_env();
    let post_id = seed_post(&db_path, "Going out now", Utc::now()).await;
    let db = Database::new(&db_path).await.unwrap();
    let Claim::Acquired(_token) = db.claim(&post_id, None, Utc::now()).await.unwrap() else {
        panic!("Expected to claim the post");
    };

    queue(&config_path)
        .args(["cancel", &post_id])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("being published"));

    queue(&config_path)
        .args(["reschedule", &post_id, "2h"])
        .assert()
        .failure()
        .code(1);

    let post = load_post(&db_path, &post_id).await;
    assert_eq!(post.status, PostStatus::Pending);
    assert!(post.is_claimed());
}

// RESCHEDULE

#[tokio::test]
async fn test_reschedule_pending_post() {
    let (_temp_dir, config_path, db_path) = setup_test_env();
    let post_id = add_post(&config_path, "Later please", "twitter", "1h");

    queue(&config_path)
        .args(["reschedule", &post_id, "2030-06-01T12:00:00Z"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2030-06-01T12:00:00+00:00"));

    let post = load_post(&db_path, &post_id).await;
    assert_eq!(
        post.scheduled_at,
        DateTime::parse_from_rfc3339("2030-06-01T12:00:00Z").unwrap()
    );
    assert_eq!(post.status, PostStatus::Pending);
}

#[tokio::test]
async fn test_reschedule_rejections() {
    let (_temp_dir, config_path, db_path) = setup_test_env();
    let post_id = add_post(&config_path, "Moving target", "twitter", "1h");

    queue(&config_path)
        .args(["reschedule", &post_id, "not a time"])
        .assert()
        .failure()
        .code(3);

    Database::new(&db_path)
        .await
        .unwrap()
        .cancel(&post_id)
        .await
        .unwrap();

    queue(&config_path)
        .args(["reschedule", &post_id, "2h"])
        .assert()
        .failure()
        .code(1);

    queue(&config_path)
        .args(["reschedule", "missing-id", "2h"])
        .assert()
        .failure()
        .code(3);
}

// CONFIGURATION

#[tokio::test]
async fn test_db_path_env_override() {
    let (temp_dir, config_path, db_path) = setup_test_env();
    let other_db = temp_dir.path().join("other.db");

    let output = queue(&config_path)
        .env("SCHEDCAST_DB_PATH", &other_db)
        .args(["add", "Elsewhere", "-p", "twitter"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let post_id = String::from_utf8(output).unwrap().trim().to_string();

    let other = Database::new(&other_db.to_string_lossy()).await.unwrap();
    assert!(other.get(&post_id).await.unwrap().is_some());

    let configured = Database::new(&db_path).await.unwrap();
    assert!(configured.get(&post_id).await.unwrap().is_none());
}
