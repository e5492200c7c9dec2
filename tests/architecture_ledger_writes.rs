use std::fs;
use std::path::{Path, PathBuf};

/// Only the ledger store may touch balances or order status in SQL
const ALLOWED_LEDGER_WRITERS: &[&str] = &["src/store/postgres.rs"];

const LEDGER_WRITE_PATTERNS: &[&str] = &[
    "UPDATE users",
    "UPDATE orders",
    "INSERT INTO orders",
    "INSERT INTO withdrawals",
];

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

#[test]
fn ledger_sql_writes_are_limited_to_the_store() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    collect_rust_files(&repo_root.join("src"), &mut files);

    let mut offenders = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        if ALLOWED_LEDGER_WRITERS.iter().any(|allowed| *allowed == rel) {
            continue;
        }
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if LEDGER_WRITE_PATTERNS.iter().any(|p| trimmed.contains(p)) {
                offenders.push(format!("{rel}:{}: {}", idx + 1, trimmed));
            }
        }
    }

    assert!(
        offenders.is_empty(),
        "ledger SQL writes detected outside the store:\n{}",
        offenders.join("\n")
    );
}

#[test]
fn engine_never_reaches_the_database_directly() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    collect_rust_files(&repo_root.join("src/engine"), &mut files);
    assert!(!files.is_empty(), "engine sources not found");

    for file in files {
        let content = fs::read_to_string(&file).unwrap_or_default();
        assert!(
            !content.contains("sqlx::"),
            "{} uses sqlx directly; go through LedgerStore",
            file.display()
        );
    }
}
