use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn run_inventario<I, S>(db: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_inventario"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env_remove("INVENTARIO_DB_PATH")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute inventario binary: {err}"))
}

fn run_json<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_inventario(db, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "inventario command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_error<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_inventario(db, args);
    assert!(!output.status.success(), "command was expected to fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    let line = stderr
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with('{'))
        .unwrap_or_else(|| panic!("no JSON error on stderr:\n{stderr}"));
    serde_json::from_str(line)
        .unwrap_or_else(|err| panic!("stderr error is not valid JSON: {err}\n{line}"))
}

fn as_f64(value: &Value, pointer: &str) -> f64 {
    value
        .pointer(pointer)
        .and_then(Value::as_f64)
        .unwrap_or_else(|| panic!("missing number at `{pointer}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string at `{pointer}` in payload: {value}"))
}

fn temp_dir() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"))
}

#[test]
fn init_reports_migrations_once() {
    let dir = temp_dir();
    let db = dir.path().join("inventario.db");

    let first = run_json(&db, ["init"]);
    let applied = first
        .pointer("/migrations/applied")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    assert!(applied > 0);

    let second = run_json(&db, ["init"]);
    assert_eq!(
        second.pointer("/migrations/applied"),
        Some(&Value::Array(Vec::new()))
    );

    let status = run_json(&db, ["status"]);
    assert_eq!(as_str(&status, "/phase"), "open");
    assert_eq!(
        status.pointer("/integrity/quick_check_ok"),
        Some(&Value::Bool(true))
    );
}

#[test]
fn statements_and_ledger_round_trip_through_cli() {
    let dir = temp_dir();
    let db = dir.path().join("inventario.db");

    let inserted = run_json(
        &db,
        [
            "exec",
            "INSERT INTO productos (codigo_interno, nombre, costo_unitario) VALUES (?, ?, ?)",
            "ACE-1",
            "Aceite 1L",
            "4.5",
        ],
    );
    let id = inserted
        .get("inserted_id")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing inserted_id: {inserted}"));
    let id_text = id.to_string();

    for (kind, quantity) in [("entrada", "10"), ("salida", "3"), ("salida", "1")] {
        run_json(
            &db,
            [
                "movement",
                "--product",
                id_text.as_str(),
                "--kind",
                kind,
                "--quantity",
                quantity,
            ],
        );
    }
    run_json(
        &db,
        [
            "movement",
            "--product",
            id_text.as_str(),
            "--kind",
            "ajuste",
            "--quantity",
            "-2",
        ],
    );

    let stock = run_json(&db, ["stock", id_text.as_str()]);
    assert!((as_f64(&stock, "/stock/stock_actual") - 4.0).abs() < f64::EPSILON);
    assert_eq!(as_str(&stock, "/stock/tipo_ultimo_movimiento"), "ajuste");
    assert!((as_f64(&stock, "/costo_unitario_ultimo") - 4.5).abs() < f64::EPSILON);

    let row = run_json(
        &db,
        [
            "get-one",
            "SELECT nombre FROM productos WHERE codigo_interno = ?",
            "ACE-1",
        ],
    );
    assert_eq!(as_str(&row, "/row/nombre"), "Aceite 1L");

    let missing = run_json(&db, ["get-one", "SELECT id FROM productos WHERE id = ?", "999"]);
    assert_eq!(missing.get("row"), Some(&Value::Null));
}

#[test]
fn errors_are_reported_as_json_on_stderr() {
    let dir = temp_dir();
    let db = dir.path().join("inventario.db");

    let malformed = run_error(&db, ["query", "SELEC * FROM productos"]);
    assert_eq!(as_str(&malformed, "/code"), "DB_QUERY_FAILED");

    let reference = run_error(
        &db,
        ["movement", "--product", "404", "--kind", "entrada", "--quantity", "1"],
    );
    assert_eq!(as_str(&reference, "/code"), "DB_REFERENCE_MISSING");

    let invalid = run_error(
        &db,
        ["movement", "--product", "1", "--kind", "entrada", "--quantity", "0"],
    );
    assert_eq!(as_str(&invalid, "/code"), "VALIDATION_INVALID_INPUT");
}

#[test]
fn backup_and_confirmed_restore() {
    let dir = temp_dir();
    let db = dir.path().join("inventario.db");
    let backup = dir.path().join("copia.db");
    let backup_text = backup.display().to_string();

    run_json(
        &db,
        ["exec", "INSERT INTO productos (nombre) VALUES ('Arroz')"],
    );
    let outcome = run_json(&db, ["backup", "--out", backup_text.as_str()]);
    assert_eq!(outcome.get("performed"), Some(&Value::Bool(true)));
    assert!(backup.exists());

    run_json(
        &db,
        ["exec", "INSERT INTO productos (nombre) VALUES ('Azucar')"],
    );

    let unconfirmed = run_error(&db, ["restore", "--in", backup_text.as_str()]);
    assert_eq!(as_str(&unconfirmed, "/code"), "VALIDATION_INVALID_INPUT");

    let restored = run_json(&db, ["restore", "--in", backup_text.as_str(), "--yes"]);
    assert_eq!(restored.get("restart_required"), Some(&Value::Bool(true)));

    let rows = run_json(&db, ["query", "SELECT nombre FROM productos ORDER BY id"]);
    let names: Vec<&str> = rows
        .get("rows")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.get("nombre").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(names, vec!["Arroz"]);

    let history = run_json(&db, ["history"]);
    let operations: Vec<&str> = history
        .get("records")
        .and_then(Value::as_array)
        .map(|records| {
            records
                .iter()
                .filter_map(|r| r.get("operacion").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(operations.len(), 2);
    assert!(operations.contains(&"backup"));
    assert!(operations.contains(&"restore"));

    let missing_dir = dir.path().join("no_existe").join("copia.db");
    let failed = run_error(
        &db,
        ["backup", "--out", missing_dir.display().to_string().as_str()],
    );
    assert_eq!(as_str(&failed, "/code"), "IO_FILE_NOT_FOUND");
}

#[test]
fn config_get_set_list() {
    let dir = temp_dir();
    let db = dir.path().join("inventario.db");

    let seeded = run_json(&db, ["config", "get", "moneda"]);
    assert_eq!(as_str(&seeded, "/valor"), "USD");

    run_json(&db, ["config", "set", "moneda", "PEN"]);
    let updated = run_json(&db, ["config", "get", "moneda"]);
    assert_eq!(as_str(&updated, "/valor"), "PEN");

    let list = run_json(&db, ["config", "list"]);
    let entries = list
        .get("entries")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    assert!(entries >= 8);
}
