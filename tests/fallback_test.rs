mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use common::write_script;
use predicates::prelude::*;
use std::process::Command;

fn one_payment_script(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let script = dir.path().join("events.csv");
    write_script(&script, &[["start", "p1", "100.0", "entry", "", ""]]).unwrap();
    script
}

#[cfg(not(feature = "storage-rocksdb"))]
#[test]
fn test_rocksdb_fallback_warning() {
    let dir = tempfile::tempdir().unwrap();
    let script = one_payment_script(&dir);

    let mut cmd = Command::new(cargo_bin!("lottopay"));
    cmd.arg(&script).arg("--db-path").arg(dir.path().join("some_db"));

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."))
        .stdout(predicate::str::contains("p1,created,100,0,,"));
}

#[cfg(feature = "storage-rocksdb")]
#[test]
fn test_rocksdb_no_fallback_warning() {
    let dir = tempfile::tempdir().unwrap();
    let script = one_payment_script(&dir);
    let db_path = dir.path().join("test_db");

    let mut cmd = Command::new(cargo_bin!("lottopay"));
    cmd.arg(&script).arg("--db-path").arg(&db_path);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("WARNING").not());
}
