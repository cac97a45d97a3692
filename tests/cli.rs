use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn nkb_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("nkb");
    path
}

const STATUTO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<atto>
  <meta>
    <doc_type>legge</doc_type><number>212</number><year>2000</year>
    <title>Disposizioni in materia di statuto dei diritti del contribuente</title>
    <valid_from>2000-08-01</valid_from>
    <source_url>https://www.normattiva.it/uri-res/N2Ls?urn:nir:stato:legge:2000-07-27;212</source_url>
  </meta>
  <articolo num="1"><comma num="1">Le disposizioni della presente legge costituiscono principi generali.</comma></articolo>
  <articolo num="3"><comma num="1">Le disposizioni tributarie non hanno effetto retroattivo.</comma></articolo>
</atto>"#;

const DECRETO: &str = r#"<atto>
  <meta><doc_type>dlgs</doc_type><number>74</number><year>2000</year>
  <valid_from>2000-04-15</valid_from></meta>
  <articolo num="1"><comma num="1">Resta fermo quanto previsto dall'art. 3 della legge 212/2000.</comma></articolo>
</atto>"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let corpus = root.join("corpus");
    fs::create_dir_all(&corpus).unwrap();
    fs::write(corpus.join("statuto.xml"), STATUTO).unwrap();
    fs::write(corpus.join("decreto.xml"), DECRETO).unwrap();
    fs::write(corpus.join("broken.xml"), "<atto><articolo>").unwrap();
    fs::write(corpus.join("notes.txt"), "not an input").unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/nkb.sqlite"

[ingest]
roots = ["{}/corpus"]

[server]
bind = "127.0.0.1:7341"

[logging]
level = "warn"
"#,
        root.display(),
        root.display()
    );

    let config_path = config_dir.join("nkb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_nkb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = nkb_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run nkb binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn ingested() -> (TempDir, PathBuf) {
    let (tmp, config) = setup_test_env();
    let (_, stderr, ok) = run_nkb(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    let (_, stderr, ok) = run_nkb(&config, &["ingest"]);
    assert!(ok, "ingest failed: {}", stderr);
    (tmp, config)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_nkb(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/nkb.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    assert!(run_nkb(&config, &["init"]).2);
    let (_, stderr, ok) = run_nkb(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_ingest_reports_failures_without_aborting() {
    let (_tmp, config) = setup_test_env();
    run_nkb(&config, &["init"]);
    let (stdout, stderr, ok) = run_nkb(&config, &["ingest"]);
    assert!(ok, "ingest failed: {}", stderr);
    assert!(stdout.contains("written: 2"), "stdout: {}", stdout);
    assert!(stdout.contains("failed: 1"), "stdout: {}", stdout);
    assert!(stdout.contains("[parse]"), "stdout: {}", stdout);
}

#[test]
fn test_ingest_json_report() {
    let (_tmp, config) = setup_test_env();
    run_nkb(&config, &["init"]);
    let (stdout, stderr, ok) = run_nkb(&config, &["ingest", "--json"]);
    assert!(ok, "ingest failed: {}", stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["pass"], "ingest");
    assert_eq!(report["written"], 2);
    let failures = report["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["stage"], "parse");
    assert_eq!(failures[0]["kind"], "malformed_input");
    assert!(failures[0]["unit"].as_str().unwrap().ends_with("broken.xml"));
}

#[test]
fn test_reingest_skips_duplicates() {
    let (_tmp, config) = ingested();
    let (stdout, _, ok) = run_nkb(&config, &["ingest"]);
    assert!(ok);
    assert!(stdout.contains("written: 0"), "stdout: {}", stdout);
    assert!(stdout.contains("skipped (duplicate): 2"), "stdout: {}", stdout);
}

#[test]
fn test_get_document_json() {
    let (_tmp, config) = ingested();
    let (stdout, stderr, ok) = run_nkb(&config, &["get", "document", "legge:212:2000", "--json"]);
    assert!(ok, "get failed: {}", stderr);
    let view: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(view["document"]["canonical"], "legge:212:2000");
    assert_eq!(view["versions"].as_array().unwrap().len(), 1);
}

#[test]
fn test_get_missing_document_fails() {
    let (_tmp, config) = ingested();
    let (_, stderr, ok) = run_nkb(&config, &["get", "document", "legge:1:1900"]);
    assert!(!ok);
    assert!(stderr.contains("not found"), "stderr: {}", stderr);
}

#[test]
fn test_text_reconstructs_version() {
    let (_tmp, config) = ingested();
    let (stdout, stderr, ok) = run_nkb(&config, &["text", "legge:212:2000", "--at", "2020-01-01"]);
    assert!(ok, "text failed: {}", stderr);
    assert!(stdout.contains("§ art3/co1"));
    assert!(stdout.contains("non hanno effetto retroattivo"));
}

#[test]
fn test_search_keyword() {
    let (_tmp, config) = ingested();
    let (stdout, _, ok) = run_nkb(&config, &["search", "retroattivo"]);
    assert!(ok);
    assert!(stdout.contains("legge:212:2000"), "stdout: {}", stdout);
    assert!(stdout.contains("Art. 3 > Comma 1"), "stdout: {}", stdout);
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config) = ingested();
    let (stdout, _, ok) = run_nkb(&config, &["search", ""]);
    assert!(ok);
    assert!(stdout.contains("No results"));
}

#[test]
fn test_reference_pipeline() {
    let (_tmp, config) = ingested();
    let (stdout, stderr, ok) = run_nkb(&config, &["extract-references"]);
    assert!(ok, "extract failed: {}", stderr);
    assert!(stdout.contains("extract-references"));

    let (_, stderr, ok) = run_nkb(&config, &["resolve-references"]);
    assert!(ok, "resolve failed: {}", stderr);

    let (stdout, _, ok) = run_nkb(&config, &["stats", "--json"]);
    assert!(ok);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["documents"], 2);
    assert!(stats["references"].as_i64().unwrap() >= 1);
    assert!(stats["resolved"].as_i64().unwrap() >= 1);
}

#[test]
fn test_conflict_commands() {
    let (_tmp, config) = ingested();
    let (stdout, stderr, ok) = run_nkb(&config, &["detect-conflicts"]);
    assert!(ok, "detect failed: {}", stderr);
    assert!(stdout.contains("detect-conflicts"));

    let (stdout, _, ok) = run_nkb(&config, &["conflicts", "list"]);
    assert!(ok);
    assert!(stdout.contains("No conflicts"));

    let (_, stderr, ok) = run_nkb(&config, &["conflicts", "list", "--status", "open"]);
    assert!(!ok);
    assert!(stderr.contains("unknown conflict status"));

    let (_, _, ok) = run_nkb(
        &config,
        &["conflicts", "review", "missing", "--reviewer", "analista"],
    );
    assert!(!ok);
}

#[test]
fn test_export_jsonl() {
    let (tmp, config) = ingested();
    let out = tmp.path().join("out/nodes.jsonl");
    let (_, stderr, ok) = run_nkb(&config, &["export", "--output", out.to_str().unwrap()]);
    assert!(ok, "export failed: {}", stderr);

    let content = fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        let record: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(record["id"].is_string());
        assert!(record["hierarchy"].is_string());
        assert!(record["text"].is_string());
    }
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(
        &bad,
        format!(
            "[db]\npath = \"{}/x.sqlite\"\n\n[versioning]\nsimilarity_threshold = 2.0\n",
            tmp.path().display()
        ),
    )
    .unwrap();
    let (_, stderr, ok) = run_nkb(&bad, &["init"]);
    assert!(!ok);
    assert!(stderr.contains("similarity_threshold"), "stderr: {}", stderr);
}
