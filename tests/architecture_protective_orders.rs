use std::fs;
use std::path::{Path, PathBuf};

/// Placement is owned by the protection executor; connectors implement and wrap it
const ALLOWED_PLACEMENT_CALLERS: &[&str] = &["src/protection/executor.rs"];
const CONNECTOR_DIR: &str = "src/exchange/";

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
fn protective_orders_are_placed_only_by_the_executor() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    collect_rust_files(&repo_root.join("src"), &mut files);
    assert!(!files.is_empty(), "no sources found under src/");

    let mut offenders = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        if rel.starts_with(CONNECTOR_DIR) || ALLOWED_PLACEMENT_CALLERS.contains(&rel.as_str()) {
            continue;
        }
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("//") {
                continue;
            }
            if trimmed.contains(".place_protective_order(") {
                offenders.push(format!("{rel}:{}: {}", idx + 1, trimmed));
            }
        }
    }

    assert!(
        offenders.is_empty(),
        "protective order placed outside the protection executor:\n{}",
        offenders.join("\n")
    );
}

#[test]
fn executor_is_the_placement_path() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let executor = fs::read_to_string(repo_root.join(ALLOWED_PLACEMENT_CALLERS[0]))
        .expect("executor source readable");
    assert!(executor.contains(".place_protective_order("));
}
