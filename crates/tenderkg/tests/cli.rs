use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const ENV_VARS: [&str; 7] = [
    "TENDERKG_DB",
    "TENDERKG_SCHEMA",
    "TENDERKG_CONCURRENCY",
    "TENDERKG_MAX_RETRIES",
    "TENDERKG_INITIAL_BACKOFF_MS",
    "TENDERKG_MAX_BACKOFF_MS",
    "TENDERKG_STORE_TIMEOUT_MS",
];

fn tkg(dir: &Path) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("tkg").into();
    cmd.current_dir(dir);
    for var in ENV_VARS {
        cmd.env_remove(var);
    }
    cmd
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Tempdir with the fixture chunks imported into `graph.db`.
fn imported() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("graph.db");
    tkg(tmp.path())
        .arg("--db")
        .arg(&db)
        .arg("import")
        .arg("--chunks")
        .arg(fixture("chunks.jsonl"))
        .assert()
        .success();
    (tmp, db)
}

// --- Binary startup ---

#[test]
fn binary_runs() {
    let mut cmd: Command = cargo_bin_cmd!("tkg").into();
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("tkg"));
}

// --- Chunk ---

#[test]
fn chunk_builds_cards_and_skips_bad_records() {
    let tmp = TempDir::new().unwrap();
    let output = tmp.path().join("chunks.jsonl");
    tkg(tmp.path())
        .arg("chunk")
        .arg("--records")
        .arg(fixture("records.jsonl"))
        .arg("--output")
        .arg(&output)
        .assert()
        .success()
        .stderr(predicate::str::contains("Wrote 2 chunks"))
        .stderr(predicate::str::contains("2 skipped"));

    let written = fs::read_to_string(&output).unwrap();
    let lines: Vec<serde_json::Value> = written
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["id"], "MOH000ETT21000001_2021-01-10");
    let text = lines[0]["text"].as_str().unwrap();
    assert!(text.starts_with("Tender: MOH000ETT21000001\nAgency: Ministry of Health"));
    assert!(!text.contains("Description:"));
    assert!(lines[1]["text"]
        .as_str()
        .unwrap()
        .contains("Description: Network maintenance for schools"));
}

#[test]
fn chunk_missing_input_fails() {
    let tmp = TempDir::new().unwrap();
    tkg(tmp.path())
        .args(["chunk", "--records", "nope.jsonl", "--output", "out.jsonl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot read"));
}

// --- Schema ---

#[test]
fn schema_summarises_builtin() {
    let tmp = TempDir::new().unwrap();
    tkg(tmp.path())
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("Schema 1.0.0 (built-in)"))
        .stdout(predicate::str::contains("(Tender)-[HAS_KEYWORD]->(Keyword)"))
        .stdout(predicate::str::contains("Agency [organization]"));
}

#[test]
fn schema_rejects_invalid_document() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("schema.json");
    fs::write(
        &path,
        r#"{"version": "1", "entities": [{"type": "Tender", "fields": ["tender_no"], "normalization": "identifier"}],
            "rules": [{"entity": "Agency", "field": "agency", "label": "Agency", "confidence": 0.9}],
            "relations": []}"#,
    )
    .unwrap();
    tkg(tmp.path())
        .arg("--schema")
        .arg(&path)
        .arg("schema")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load schema"));
}

// --- Import ---

#[test]
fn import_reports_and_creates_database() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("nested").join("graph.db");
    tkg(tmp.path())
        .arg("--db")
        .arg(&db)
        .arg("import")
        .arg("--chunks")
        .arg(fixture("chunks.jsonl"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Chunks: 4 merged, 0 failed, 0 skipped"));
    assert!(db.exists());
}

#[test]
fn import_twice_creates_nothing_new() {
    let (tmp, db) = imported();
    let output = tkg(tmp.path())
        .arg("--db")
        .arg(&db)
        .arg("import")
        .arg("--json")
        .arg("--chunks")
        .arg(fixture("chunks.jsonl"))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let reports = report["reports"].as_array().unwrap();
    assert_eq!(reports.len(), 4);
    for r in reports {
        assert_eq!(r["errors"].as_array().unwrap().len(), 0);
        assert_eq!(r["chunk_created"], false);
        assert_eq!(r["entities_created"], 0);
        assert_eq!(r["relations_created"], 0);
        assert_eq!(r["mentions_created"], 0);
    }
}

#[test]
fn import_with_other_schema_version_aborts() {
    let (tmp, db) = imported();
    let schema = tmp.path().join("schema.json");
    fs::write(
        &schema,
        r#"{"version": "2.0.0", "entities": [{"type": "Tender", "fields": ["tender_no"], "normalization": "identifier"}],
            "rules": [{"entity": "Tender", "field": "tender_no", "label": "Tender", "confidence": 1.0}],
            "relations": []}"#,
    )
    .unwrap();
    tkg(tmp.path())
        .arg("--db")
        .arg(&db)
        .arg("--schema")
        .arg(&schema)
        .arg("import")
        .arg("--chunks")
        .arg(fixture("chunks.jsonl"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("schema version 1.0.0"));
}

// --- Similar ---

#[test]
fn similar_ranks_keyword_match_first() {
    let (tmp, db) = imported();
    let output = tkg(tmp.path())
        .arg("--db")
        .arg(&db)
        .args(["similar", "--tender", "t1", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let ranked: Vec<serde_json::Value> = serde_json::from_slice(&output).unwrap();
    let ids: Vec<&str> = ranked.iter().map(|r| r["tender_id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["T2", "T3"]);
    assert_eq!(ranked[0]["overlap_count"], 2);
    assert_eq!(ranked[1]["shared_requirements"][0], "iso27001");
}

#[test]
fn similar_with_other_schema_version_aborts() {
    let (tmp, db) = imported();
    let schema = tmp.path().join("schema.json");
    fs::write(
        &schema,
        r#"{"version": "2.0.0", "entities": [{"type": "Tender", "fields": ["tender_no"], "normalization": "identifier"}],
            "rules": [{"entity": "Tender", "field": "tender_no", "label": "Tender", "confidence": 1.0}],
            "relations": []}"#,
    )
    .unwrap();
    tkg(tmp.path())
        .arg("--db")
        .arg(&db)
        .arg("--schema")
        .arg(&schema)
        .args(["similar", "--tender", "T1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("schema version 1.0.0"));

    tkg(tmp.path())
        .arg("--db")
        .arg(&db)
        .arg("--schema")
        .arg(&schema)
        .arg("audit")
        .assert()
        .failure()
        .stderr(predicate::str::contains("schema version 1.0.0"));
}

#[test]
fn similar_unknown_tender_fails() {
    let (tmp, db) = imported();
    tkg(tmp.path())
        .arg("--db")
        .arg(&db)
        .args(["similar", "--tender", "NOPE"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NOPE is not in the graph"));
}

// --- Audit ---

#[test]
fn audit_finds_no_orphans_after_import() {
    let (tmp, db) = imported();
    tkg(tmp.path())
        .arg("--db")
        .arg(&db)
        .arg("audit")
        .assert()
        .success()
        .stdout(predicate::str::contains("Chunks: 4"))
        .stdout(predicate::str::contains("Every entity is mentioned by at least one chunk"));
}
