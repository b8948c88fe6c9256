//! Drives the `localmind` binary against a temp data dir and a mock
//! embeddings endpoint.

use std::fs;
use std::path::{Path, PathBuf};

use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::process::Command;

const KEYWORDS: [&str; 3] = ["rust", "python", "kubernetes"];

/// One dimension per keyword plus a constant, so every vector is non-zero.
fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v: Vec<f32> = KEYWORDS
        .iter()
        .map(|k| if lower.contains(k) { 1.0 } else { 0.0 })
        .collect();
    v.push(0.1);
    v
}

async fn embeddings(Json(body): Json<Value>) -> Json<Value> {
    let inputs: Vec<String> = match &body["input"] {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    let data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .map(|(index, text)| json!({"index": index, "embedding": keyword_vector(text)}))
        .collect();
    Json(json!({ "data": data }))
}

async fn serve_embeddings() -> u16 {
    let app = Router::new().route("/v1/embeddings", post(embeddings));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn setup_test_env(port: u16) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha\n\nNotes about Rust programming.\n\nCargo builds crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta\n\nPython and machine learning.\n\nPyTorch is covered here.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma deployment notes.\n\nKubernetes clusters and Docker images.",
    )
    .unwrap();

    let config_content = format!(
        r#"[storage]
data_dir = "{root}/data"

[server]
port = {port}

[embedding]
provider = "llama"
max_retries = 0

[chunking]
max_tokens = 64
"#,
        root = root.display(),
        port = port
    );
    let config_path = root.join("localmind.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

async fn run_localmind(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_localmind"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("RUST_LOG", "localmind=warn")
        .output()
        .await
        .expect("failed to run localmind");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn file_arg(root: &Path, name: &str) -> String {
    root.join("files").join(name).display().to_string()
}

fn resource_id(listing: &str, name: &str) -> String {
    listing
        .lines()
        .find(|l| l.contains(name))
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or_else(|| panic!("{} not listed in:\n{}", name, listing))
        .to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_index_search_and_deleted_file_notice() {
    let port = serve_embeddings().await;
    let (tmp, config) = setup_test_env(port);
    let root = tmp.path();

    let (stdout, stderr, ok) = run_localmind(
        &config,
        &[
            "index",
            &file_arg(root, "alpha.md"),
            &file_arg(root, "beta.md"),
            &file_arg(root, "gamma.txt"),
            "--progress",
            "off",
        ],
    )
    .await;
    assert!(ok, "index failed: {}", stderr);
    assert!(stdout.contains("Index complete"), "{}", stdout);
    assert!(!stdout.contains("failed:"), "{}", stdout);

    let (listing, _, ok) = run_localmind(&config, &["resources"]).await;
    assert!(ok);
    for name in ["alpha.md", "beta.md", "gamma.txt"] {
        assert!(listing.contains(name), "{} missing from:\n{}", name, listing);
    }

    let (stdout, _, ok) = run_localmind(&config, &["search", "rust", "--limit", "1"]).await;
    assert!(ok);
    assert!(stdout.contains("alpha.md"), "{}", stdout);
    assert!(!stdout.contains("beta.md"), "{}", stdout);

    fs::remove_file(root.join("files").join("beta.md")).unwrap();
    let (stdout, stderr, ok) = run_localmind(&config, &["index", "--progress", "off"]).await;
    assert!(ok, "re-index failed: {}", stderr);
    assert!(stdout.contains("moved or deleted"), "{}", stdout);
    assert!(stdout.contains("beta.md"), "{}", stdout);
    // Unchanged files keep their cached vectors.
    assert!(stdout.contains("chunks embedded: 0"), "{}", stdout);

    let (listing, _, _) = run_localmind(&config, &["resources"]).await;
    assert!(listing.contains("alpha.md"));
    assert!(listing.contains("gamma.txt"));
    assert!(!listing.contains("beta.md"));

    let (stdout, _, _) = run_localmind(&config, &["search", "python"]).await;
    assert!(!stdout.contains("beta.md"), "{}", stdout);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_folder_resource_and_remove() {
    let port = serve_embeddings().await;
    let (tmp, config) = setup_test_env(port);
    let folder = tmp.path().join("files").display().to_string();

    let (stdout, stderr, ok) = run_localmind(&config, &["index", &folder, "--progress", "off"]).await;
    assert!(ok, "index failed: {}", stderr);
    assert!(stdout.contains("resources:      1"), "{}", stdout);

    let (stdout, _, _) = run_localmind(&config, &["search", "kubernetes", "--limit", "1"]).await;
    assert!(stdout.contains("gamma.txt"), "{}", stdout);

    let (listing, _, _) = run_localmind(&config, &["resources"]).await;
    let id = resource_id(&listing, "files");
    let (stdout, _, ok) = run_localmind(&config, &["remove", &id]).await;
    assert!(ok);
    assert!(stdout.contains("Removed files"), "{}", stdout);

    let (stdout, _, _) = run_localmind(&config, &["search", "kubernetes"]).await;
    assert!(stdout.contains("No results."), "{}", stdout);

    let (_, stderr, ok) = run_localmind(&config, &["remove", &id]).await;
    assert!(!ok);
    assert!(stderr.contains("No resource with id"), "{}", stderr);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_progress_mode_is_rejected() {
    let port = serve_embeddings().await;
    let (tmp, config) = setup_test_env(port);
    let file = file_arg(tmp.path(), "alpha.md");

    let (_, stderr, ok) = run_localmind(&config, &["index", &file, "--progress", "fancy"]).await;
    assert!(!ok);
    assert!(stderr.contains("Unknown progress mode"), "{}", stderr);
}
