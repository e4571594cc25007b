//! Single-file unified-diff validation and application.
//!
//! The applier is deliberately hand-rolled: context lines must match the
//! target exactly, `-` lines consume source, `+` lines append, `\ No
//! newline` markers are skipped, and `---`/`+++` headers are ignored (the
//! target file is addressed by the explicit `path` argument, never by the
//! header paths). This keeps hunk semantics auditable and avoids an
//! external patch dependency.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use warden_protocol::ErrorCode;
use warden_protocol::OpError;

static HUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@") {
        Ok(re) => re,
        Err(_) => unreachable!("hunk regex is a valid constant"),
    }
});

#[derive(Debug, Clone, Serialize)]
pub struct PatchOutcome {
    pub path: String,
    pub lines_added: u64,
    pub lines_removed: u64,
}

/// Validate and apply a single-file unified diff in place.
pub fn apply_patch(path: &Path, patch_content: &str, max_size_kb: u64) -> Result<PatchOutcome, OpError> {
    let max_bytes = max_size_kb * 1024;
    if patch_content.len() as u64 > max_bytes {
        return Err(
            OpError::new(
                ErrorCode::PatchTooLarge,
                format!("Patch exceeds {max_size_kb}KB limit"),
            )
            .with_details(json!({
                "size_bytes": patch_content.len(),
                "max_size_bytes": max_bytes,
            })),
        );
    }

    if !(patch_content.contains("---")
        && patch_content.contains("+++")
        && patch_content.contains("@@"))
    {
        return Err(
            OpError::new(
                ErrorCode::InvalidPatchFormat,
                "Patch must be valid unified diff format (missing ---, +++, or @@ markers)",
            )
            .with_details(json!({
                "patch_preview": patch_content.chars().take(200).collect::<String>(),
            })),
        );
    }

    // A multi-file patch would silently apply foreign hunks to the target.
    let source_file_count = count_source_files(patch_content);
    if source_file_count > 1 {
        return Err(
            OpError::new(
                ErrorCode::InvalidPatchFormat,
                format!(
                    "Patch targets {source_file_count} files but apply_patch accepts only single-file patches"
                ),
            )
            .with_details(json!({"source_file_count": source_file_count})),
        );
    }

    if uses_dev_null_headers(patch_content) {
        return Err(
            OpError::new(
                ErrorCode::PatchApplyFailed,
                "Creating or deleting files via /dev/null headers is not supported",
            )
            .with_details(json!({"path": path.display().to_string()})),
        );
    }

    if !path.exists() {
        return Err(OpError::new(ErrorCode::PathNotFound, "Path not found")
            .with_details(json!({"path": path.display().to_string()})));
    }

    let (lines_added, lines_removed) = count_diff_lines(patch_content);

    let original = std::fs::read_to_string(path).map_err(|e| {
        OpError::new(
            ErrorCode::PatchApplyFailed,
            format!("Failed to read target file: {e}"),
        )
        .with_details(json!({"path": path.display().to_string()}))
    })?;
    let patched = apply_to_content(&original, patch_content)
        .map_err(|err| err.with_details(json!({"path": path.display().to_string()})))?;
    std::fs::write(path, patched).map_err(|e| {
        OpError::new(
            ErrorCode::PatchApplyFailed,
            format!("Failed to write patched file: {e}"),
        )
        .with_details(json!({"path": path.display().to_string()}))
    })?;

    info!(
        path = %path.display(),
        lines_added,
        lines_removed,
        "patch_applied"
    );

    Ok(PatchOutcome {
        path: path.display().to_string(),
        lines_added,
        lines_removed,
    })
}

/// Distinct source paths in `--- ` headers, excluding `/dev/null`.
fn count_source_files(patch_content: &str) -> usize {
    let mut sources: HashSet<&str> = HashSet::new();
    for line in patch_content.lines() {
        if let Some(rest) = line.strip_prefix("--- ") {
            let path_part = rest.split('\t').next().unwrap_or("").trim();
            if !path_part.is_empty() && path_part != "/dev/null" {
                sources.insert(path_part);
            }
        }
    }
    sources.len()
}

/// `/dev/null` headers mean file creation or deletion, which patching a
/// known existing file never does.
fn uses_dev_null_headers(patch_content: &str) -> bool {
    patch_content
        .lines()
        .any(|line| line.starts_with("--- /dev/null") || line.starts_with("+++ /dev/null"))
}

/// Count `+`/`-` content lines, excluding the `+++`/`---` headers.
fn count_diff_lines(patch_content: &str) -> (u64, u64) {
    let mut added = 0;
    let mut removed = 0;
    for line in patch_content.lines() {
        if line.starts_with('+') && !line.starts_with("+++") {
            added += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            removed += 1;
        }
    }
    (added, removed)
}

/// Split preserving line terminators, so context comparison is exact.
fn split_keep_newlines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (idx, byte) in text.bytes().enumerate() {
        if byte == b'\n' {
            lines.push(&text[start..=idx]);
            start = idx + 1;
        }
    }
    if start < text.len() {
        lines.push(&text[start..]);
    }
    lines
}

/// Context equality. The second arm covers the final source line lacking a
/// trailing newline while the patch line carries one (`\ No newline` cases).
fn line_eq(payload: &str, src: &str) -> bool {
    payload == src || (!src.ends_with('\n') && payload.strip_suffix('\n') == Some(src))
}

fn hunk_mismatch(expected: &str, found: Option<&str>) -> OpError {
    OpError::new(
        ErrorCode::PatchApplyFailed,
        "Patch application failed (hunk mismatch or conflict)",
    )
    .with_details(json!({
        "expected": expected.trim_end_matches('\n'),
        "found": found.map(|l| l.trim_end_matches('\n')),
    }))
}

/// Apply the hunks of `patch_content` to `original`, returning the new
/// content. Any context or removal mismatch fails the whole patch.
pub fn apply_to_content(original: &str, patch_content: &str) -> Result<String, OpError> {
    let source = split_keep_newlines(original);
    let patch_lines = split_keep_newlines(patch_content);
    let mut result: Vec<&str> = Vec::with_capacity(source.len());
    let mut src_index = 0usize;
    let mut i = 0usize;

    while i < patch_lines.len() {
        let line = patch_lines[i];
        if line.starts_with("--- ") || line.starts_with("+++ ") {
            i += 1;
            continue;
        }

        let Some(captures) = HUNK_RE.captures(line.trim_end_matches('\n')) else {
            i += 1;
            continue;
        };
        let old_start: usize = captures
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(1);

        // Copy the untouched segment up to the hunk start.
        let target_index = old_start.saturating_sub(1);
        while src_index < target_index && src_index < source.len() {
            result.push(source[src_index]);
            src_index += 1;
        }
        i += 1;

        while i < patch_lines.len() {
            let hunk_line = patch_lines[i];
            if hunk_line.starts_with("@@") {
                break;
            }
            if hunk_line.starts_with('\\') {
                // "\ No newline at end of file"
                i += 1;
                continue;
            }
            if hunk_line.starts_with("--- ") || hunk_line.starts_with("+++ ") {
                break;
            }

            let (marker, payload) = match hunk_line.as_bytes().first() {
                Some(b' ') => (' ', &hunk_line[1..]),
                Some(b'-') => ('-', &hunk_line[1..]),
                Some(b'+') => ('+', &hunk_line[1..]),
                // A bare newline inside a hunk is an empty context line.
                Some(b'\n') => (' ', hunk_line),
                _ => break,
            };

            match marker {
                ' ' => {
                    if src_index >= source.len() || !line_eq(payload, source[src_index]) {
                        return Err(hunk_mismatch(payload, source.get(src_index).copied()));
                    }
                    result.push(source[src_index]);
                    src_index += 1;
                }
                '-' => {
                    if src_index >= source.len() || !line_eq(payload, source[src_index]) {
                        return Err(hunk_mismatch(payload, source.get(src_index).copied()));
                    }
                    src_index += 1;
                }
                _ => result.push(payload),
            }
            i += 1;
        }
    }

    while src_index < source.len() {
        result.push(source[src_index]);
        src_index += 1;
    }

    Ok(result.concat())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    const SIMPLE_PATCH: &str = "\
--- a.txt
+++ a.txt
@@ -1,3 +1,3 @@
 line1
-line2
+line2_modified
 line3
";

    #[test]
    fn applies_simple_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "line1\nline2\nline3\n").unwrap();

        let outcome = apply_patch(&file, SIMPLE_PATCH, 50).unwrap();
        assert_eq!(outcome.lines_added, 1);
        assert_eq!(outcome.lines_removed, 1);
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "line1\nline2_modified\nline3\n"
        );
    }

    #[test]
    fn applies_multiple_hunks() {
        let original: String = (1..=10).map(|n| format!("line{n}\n")).collect();
        let patch = "\
--- f.txt
+++ f.txt
@@ -1,3 +1,3 @@
 line1
-line2
+LINE2
 line3
@@ -8,3 +8,4 @@
 line8
 line9
+line9.5
 line10
";
        let patched = apply_to_content(&original, patch).unwrap();
        let expected =
            "line1\nLINE2\nline3\nline4\nline5\nline6\nline7\nline8\nline9\nline9.5\nline10\n";
        assert_eq!(patched, expected);
    }

    #[test]
    fn context_mismatch_fails_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "different\ncontent\nentirely\n").unwrap();

        let err = apply_patch(&file, SIMPLE_PATCH, 50).unwrap_err();
        assert_eq!(err.code, ErrorCode::PatchApplyFailed);
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "different\ncontent\nentirely\n"
        );
    }

    #[test]
    fn rejects_oversize_patch() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "x\n").unwrap();
        let huge = format!("--- a\n+++ a\n@@ -1 +1 @@\n{}", "+x\n".repeat(40_000));
        let err = apply_patch(&file, &huge, 50).unwrap_err();
        assert_eq!(err.code, ErrorCode::PatchTooLarge);
    }

    #[test]
    fn rejects_missing_markers() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "x\n").unwrap();
        let err = apply_patch(&file, "not a diff at all", 50).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPatchFormat);
    }

    #[test]
    fn rejects_two_file_patch_with_count_detail() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "a\n").unwrap();
        let patch = "\
--- a.txt
+++ a.txt
@@ -1 +1 @@
-a
+A
--- b.txt
+++ b.txt
@@ -1 +1 @@
-b
+B
";
        let err = apply_patch(&file, patch, 50).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPatchFormat);
        assert_eq!(err.details.unwrap()["source_file_count"], 2);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "a\n");
    }

    #[test]
    fn rejects_dev_null_headers() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "a\n").unwrap();
        let patch = "\
--- /dev/null
+++ a.txt
@@ -0,0 +1 @@
+new file
";
        let err = apply_patch(&file, patch, 50).unwrap_err();
        assert_eq!(err.code, ErrorCode::PatchApplyFailed);
    }

    #[test]
    fn rejects_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let err = apply_patch(&dir.path().join("ghost.txt"), SIMPLE_PATCH, 50).unwrap_err();
        assert_eq!(err.code, ErrorCode::PathNotFound);
    }

    #[test]
    fn line_counts_exclude_headers() {
        let (added, removed) = count_diff_lines(SIMPLE_PATCH);
        assert_eq!((added, removed), (1, 1));
    }

    #[test]
    fn skips_no_newline_marker() {
        let original = "one\ntwo";
        let patch = "\
--- f
+++ f
@@ -1,2 +1,2 @@
 one
-two
\\ No newline at end of file
+two!
\\ No newline at end of file
";
        let patched = apply_to_content(original, patch).unwrap();
        assert_eq!(patched, "one\ntwo!\n");
    }
}
