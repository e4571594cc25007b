//! Filesystem capability: recursive listing with pruned directories,
//! bounded UTF-8 reads, deadline-bounded ripgrep search, and single-file
//! unified-diff patching.

mod patch;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use serde_json::json;
use tokio::process::Command;

use warden_protocol::ErrorCode;
use warden_protocol::OpError;

pub use patch::PatchOutcome;
pub use patch::apply_patch;

/// Directory names pruned from every traversal and search.
pub const EXCLUDED_DIRS: [&str; 3] = [".git", ".venv", "node_modules"];

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub modified_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub files: Vec<FileEntry>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadResult {
    pub path: String,
    pub size: u64,
    pub modified_at: i64,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub path: String,
    pub line: u64,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub matches: Vec<SearchMatch>,
    pub count: usize,
}

fn modified_epoch(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn require_directory(path: &Path) -> Result<(), OpError> {
    if !path.exists() {
        return Err(OpError::new(ErrorCode::PathNotFound, "Path not found")
            .with_details(json!({"path": path.display().to_string()})));
    }
    if !path.is_dir() {
        return Err(
            OpError::new(ErrorCode::InvalidDirectory, "Path must be a directory")
                .with_details(json!({"path": path.display().to_string()})),
        );
    }
    Ok(())
}

/// Recursive walk from `path`, pruning [`EXCLUDED_DIRS`] at every level.
pub fn list_files(path: &Path) -> Result<ListResult, OpError> {
    require_directory(path)?;

    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(path).into_iter().filter_entry(|entry| {
        if entry.file_type().is_dir() {
            let name = entry.file_name().to_string_lossy();
            !EXCLUDED_DIRS.contains(&name.as_ref())
        } else {
            true
        }
    });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // A file disappearing mid-walk is not fatal.
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        files.push(FileEntry {
            path: entry.path().display().to_string(),
            size: metadata.len(),
            modified_at: modified_epoch(&metadata),
        });
    }

    let count = files.len();
    Ok(ListResult { files, count })
}

/// Bounded UTF-8 read. Binary content (NUL in the first 4 KiB, or invalid
/// UTF-8 anywhere) is rejected rather than mangled.
pub fn read_file(path: &Path, max_size_mb: u64) -> Result<ReadResult, OpError> {
    if !path.exists() {
        return Err(OpError::new(ErrorCode::PathNotFound, "Path not found")
            .with_details(json!({"path": path.display().to_string()})));
    }
    if !path.is_file() {
        return Err(OpError::new(ErrorCode::InvalidFile, "Path must be a file")
            .with_details(json!({"path": path.display().to_string()})));
    }

    let metadata = std::fs::metadata(path).map_err(|e| {
        OpError::new(ErrorCode::PathNotFound, format!("Failed to stat file: {e}"))
            .with_details(json!({"path": path.display().to_string()}))
    })?;
    let max_bytes = max_size_mb * 1024 * 1024;
    if metadata.len() > max_bytes {
        return Err(
            OpError::new(
                ErrorCode::FileTooLarge,
                format!("File exceeds {max_size_mb}MB limit"),
            )
            .with_details(json!({
                "path": path.display().to_string(),
                "size_bytes": metadata.len(),
                "max_size_bytes": max_bytes,
            })),
        );
    }

    let bytes = std::fs::read(path).map_err(|e| {
        OpError::new(ErrorCode::PathNotFound, format!("Failed to read file: {e}"))
            .with_details(json!({"path": path.display().to_string()}))
    })?;
    let sample_len = bytes.len().min(4096);
    if bytes[..sample_len].contains(&0) {
        return Err(
            OpError::new(ErrorCode::BinaryNotSupported, "Binary files not supported")
                .with_details(json!({"path": path.display().to_string()})),
        );
    }
    let content = String::from_utf8(bytes).map_err(|e| {
        OpError::new(ErrorCode::BinaryNotSupported, "Binary files not supported")
            .with_details(json!({
                "path": path.display().to_string(),
                "error": e.to_string(),
            }))
    })?;

    Ok(ReadResult {
        path: path.display().to_string(),
        size: metadata.len(),
        modified_at: modified_epoch(&metadata),
        content,
    })
}

/// Recursive substring search via ripgrep under a wall-clock deadline.
///
/// Exit code 1 (no matches) yields an empty result; malformed output lines
/// are skipped, not fatal.
pub async fn search_files(
    path: &Path,
    pattern: &str,
    timeout_seconds: u64,
) -> Result<SearchResult, OpError> {
    require_directory(path)?;
    if pattern.is_empty() {
        return Err(
            OpError::new(ErrorCode::InvalidPattern, "Search pattern must not be empty")
                .with_details(json!({"path": path.display().to_string()})),
        );
    }

    let mut cmd = Command::new("rg");
    cmd.arg("--line-number")
        .arg("--with-filename")
        .arg("--no-heading")
        .arg("--color")
        .arg("never");
    for dir in EXCLUDED_DIRS {
        cmd.arg("--glob").arg(format!("!{dir}/**"));
    }
    cmd.arg(pattern)
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output_future = cmd.output();
    let output = match tokio::time::timeout(
        Duration::from_secs(timeout_seconds),
        output_future,
    )
    .await
    {
        // Dropping the future on timeout kills the child (kill_on_drop).
        Err(_) => {
            return Err(
                OpError::new(
                    ErrorCode::SearchTimeout,
                    format!("Search timed out after {timeout_seconds}s"),
                )
                .with_details(json!({
                    "path": path.display().to_string(),
                    "pattern": pattern,
                }))
                .retryable(),
            );
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(OpError::new(
                ErrorCode::RgNotFound,
                "ripgrep (rg) is required for search operations",
            )
            .with_details(json!({"path": path.display().to_string()})));
        }
        Ok(Err(e)) => {
            return Err(
                OpError::new(ErrorCode::SearchError, format!("Search failed: {e}"))
                    .with_details(json!({"path": path.display().to_string()})),
            );
        }
        Ok(Ok(output)) => output,
    };

    match output.status.code() {
        Some(0) => {}
        // ripgrep uses 1 for "no matches".
        Some(1) => {
            return Ok(SearchResult {
                matches: Vec::new(),
                count: 0,
            });
        }
        _ => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(OpError::new(ErrorCode::SearchError, "Search failed")
                .with_details(json!({
                    "path": path.display().to_string(),
                    "pattern": pattern,
                    "stderr": stderr,
                })));
        }
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut matches = Vec::new();
    for line in stdout.lines() {
        // Format: path:line_number:content. Malformed lines are skipped.
        let mut parts = line.splitn(3, ':');
        let (Some(file), Some(line_no), Some(content)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Ok(line_no) = line_no.parse::<u64>() else {
            continue;
        };
        matches.push(SearchMatch {
            path: file.to_string(),
            line: line_no,
            content: content.to_string(),
        });
    }

    let count = matches.len();
    Ok(SearchResult { matches, count })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    fn scratch_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "world").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        dir
    }

    #[test]
    fn list_prunes_excluded_dirs() {
        let dir = scratch_tree();
        let result = list_files(dir.path()).unwrap();
        let mut names: Vec<&str> = result
            .files
            .iter()
            .map(|f| f.path.rsplit('/').next().unwrap())
            .collect();
        names.sort_unstable();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(result.count, 2);
    }

    #[test]
    fn list_rejects_missing_and_non_directories() {
        let dir = scratch_tree();
        let err = list_files(&dir.path().join("nope")).unwrap_err();
        assert_eq!(err.code, ErrorCode::PathNotFound);
        let err = list_files(&dir.path().join("a.txt")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDirectory);
    }

    #[test]
    fn read_returns_content_and_metadata() {
        let dir = scratch_tree();
        let result = read_file(&dir.path().join("a.txt"), 10).unwrap();
        assert_eq!(result.content, "hello");
        assert_eq!(result.size, 5);
        assert!(result.modified_at > 0);
    }

    #[test]
    fn read_rejects_oversize_and_binary() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big.txt");
        std::fs::write(&big, vec![b'x'; 2 * 1024 * 1024]).unwrap();
        let err = read_file(&big, 1).unwrap_err();
        assert_eq!(err.code, ErrorCode::FileTooLarge);

        let binary = dir.path().join("blob.bin");
        std::fs::write(&binary, b"ab\x00cd").unwrap();
        let err = read_file(&binary, 10).unwrap_err();
        assert_eq!(err.code, ErrorCode::BinaryNotSupported);

        let bad_utf8 = dir.path().join("latin1.txt");
        std::fs::write(&bad_utf8, vec![b'h', 0xE9, b'!']).unwrap();
        let err = read_file(&bad_utf8, 10).unwrap_err();
        assert_eq!(err.code, ErrorCode::BinaryNotSupported);
    }

    #[test]
    fn read_rejects_directory_target() {
        let dir = scratch_tree();
        let err = read_file(&dir.path().join("sub"), 10).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFile);
    }

    #[tokio::test]
    async fn search_rejects_empty_pattern() {
        let dir = scratch_tree();
        let err = search_files(dir.path(), "", 5).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPattern);
    }

    #[tokio::test]
    async fn search_finds_matches_and_skips_excluded() {
        let dir = scratch_tree();
        let result = match search_files(dir.path(), "hello", 5).await {
            Ok(result) => result,
            // Machines without ripgrep cannot exercise this path.
            Err(err) if err.code == ErrorCode::RgNotFound => return,
            Err(err) => panic!("unexpected error: {err}"),
        };
        assert_eq!(result.count, 1);
        assert!(result.matches[0].path.ends_with("a.txt"));
        assert_eq!(result.matches[0].line, 1);
    }

    #[tokio::test]
    async fn search_no_match_is_empty_result() {
        let dir = scratch_tree();
        match search_files(dir.path(), "no_such_needle_zzz", 5).await {
            Ok(result) => {
                assert_eq!(result.count, 0);
                assert!(result.matches.is_empty());
            }
            Err(err) if err.code == ErrorCode::RgNotFound => {}
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
}
