//! CLI integration tests
//!
//! Run the `relgraph` binary against a scratch database: map records in,
//! then read them back with `show` and `list`.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

const SCHEMA: &str = r#"{
    "name": "garage",
    "mappings": [
        {"name": "Person", "attributes": ["name"]},
        {
            "name": "Car",
            "attributes": ["colour"],
            "relationships": {
                "owner": {"mapping": "Person", "type": "OneToMany", "reverse": "cars"}
            }
        }
    ]
}"#;

const DATA: &str = r#"[
    {"id": "c1", "colour": "red", "owner": {"id": "p1", "name": "Ann"}},
    {"id": "c2", "colour": "blue", "owner": "p1"},
    true
]"#;

fn setup(temp_dir: &TempDir) -> (PathBuf, PathBuf, PathBuf) {
    let schema = temp_dir.path().join("garage.json");
    let data = temp_dir.path().join("cars.json");
    fs::write(&schema, SCHEMA).unwrap();
    fs::write(&data, DATA).unwrap();
    (schema, data, temp_dir.path().join("graph.db"))
}

fn relgraph(temp_dir: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_relgraph"))
        .current_dir(temp_dir.path())
        .args(args)
        .output()
        .expect("Failed to execute CLI")
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "CLI command should succeed. Stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

#[test]
fn test_cli_map_show_and_list() {
    let temp_dir = TempDir::new().unwrap();
    let (schema, data, db) = setup(&temp_dir);
    let db = db.to_str().unwrap();

    // When: records are mapped into the database
    let output = relgraph(
        &temp_dir,
        &[
            "map",
            "--schema",
            schema.to_str().unwrap(),
            "--mapping",
            "Car",
            "--data",
            data.to_str().unwrap(),
            "--db",
            db,
        ],
    );

    // Then: two cars mapped, the boolean record failed, three documents merged
    let summary = stdout_json(&output);
    let instances = summary["instances"].as_array().unwrap();
    assert_eq!(instances.len(), 3);
    assert!(instances[0].is_string());
    assert!(instances[2].is_null());
    assert!(summary["errors"][2].is_string());
    assert_eq!(summary["merged"]["documents"], 3);

    // And: show prints the first car
    let car_id = instances[0].as_str().unwrap();
    let car = stdout_json(&relgraph(&temp_dir, &["show", car_id, "--db", db]));
    assert_eq!(car["_id"], car_id);
    assert_eq!(car["type"], "Car");
    assert_eq!(car["colour"], "red");

    // And: list filters by mapping and field
    let people = stdout_json(&relgraph(
        &temp_dir,
        &["list", "--collection", "garage", "--mapping", "Person", "--db", db],
    ));
    assert_eq!(people.as_array().unwrap().len(), 1);
    assert_eq!(people[0]["cars"].as_array().unwrap().len(), 2);

    let red = stdout_json(&relgraph(
        &temp_dir,
        &["list", "--collection", "garage", "--field", "colour=red", "--db", db],
    ));
    assert_eq!(red.as_array().unwrap().len(), 1);
}

#[test]
fn test_cli_show_unknown_document_fails() {
    let temp_dir = TempDir::new().unwrap();
    let (_, _, db) = setup(&temp_dir);

    let output = relgraph(&temp_dir, &["show", "nope", "--db", db.to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no document"));
}

#[test]
fn test_cli_map_rejects_unknown_mapping() {
    let temp_dir = TempDir::new().unwrap();
    let (schema, data, db) = setup(&temp_dir);

    let output = relgraph(
        &temp_dir,
        &[
            "map",
            "--schema",
            schema.to_str().unwrap(),
            "--mapping",
            "Boat",
            "--data",
            data.to_str().unwrap(),
            "--db",
            db.to_str().unwrap(),
        ],
    );

    assert!(!output.status.success());
}
