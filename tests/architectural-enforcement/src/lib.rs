//! Architectural Enforcement
//!
//! Line-based source scanners backing the integration tests in `tests/`:
//! - No sleep in production code, except retry backoff
//! - No blocking I/O inside async functions
//!
//! The scanners are heuristics over source text, not a parser. Test modules
//! (`#[cfg(test)] mod tests`) and test-only files are not production code and
//! are skipped.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["gateway/core/src", "gateway/daemon/src"];

/// Files that only exist for tests
const TEST_ONLY_FILES: &[&str] = &["test_utils.rs"];

// ============================================================================
// Sources
// ============================================================================

/// Production part of one source file
#[derive(Debug)]
pub struct SourceFile {
    /// Path on disk
    pub path: PathBuf,
    content: String,
}

impl SourceFile {
    /// Wrap source text, dropping the trailing test module if any
    pub fn new(path: impl Into<PathBuf>, content: &str) -> Self {
        let lines: Vec<&str> = content.lines().collect();
        let end = test_module_start(&lines).unwrap_or(lines.len());
        Self {
            path: path.into(),
            content: lines[..end].join("\n"),
        }
    }

    /// Production lines
    pub fn lines(&self) -> Vec<&str> {
        self.content.lines().collect()
    }
}

/// Workspace root, two levels above this crate
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Every production `.rs` file under [`PRODUCTION_DIRS`]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            let file = entry.path();
            if file.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let name = file.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if TEST_ONLY_FILES.contains(&name) {
                continue;
            }
            if let Ok(content) = fs::read_to_string(file) {
                files.push(SourceFile::new(file, &content));
            }
        }
    }
    files
}

fn test_module_start(lines: &[&str]) -> Option<usize> {
    lines.iter().enumerate().find_map(|(i, line)| {
        if line.trim() != "#[cfg(test)]" {
            return None;
        }
        let next = lines[i + 1..].iter().map(|l| l.trim()).find(|l| !l.is_empty())?;
        next.starts_with("mod tests").then_some(i)
    })
}

// ============================================================================
// Violations
// ============================================================================

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// What rule it breaks
    pub reason: &'static str,
    /// Offending source line
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.reason,
            self.text
        )
    }
}

/// Code before any `//` comment
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Sleep calls outside retry backoff and test functions
pub fn find_sleep_violations(files: &[SourceFile]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for file in files {
        let lines = file.lines();
        for (idx, line) in lines.iter().enumerate() {
            let code = code_part(line);
            if !(code.contains("::sleep(") || code.contains(".sleep(")) {
                continue;
            }
            if is_in_test_function(&lines, idx)
                || is_backoff_context(&lines, idx)
                || is_interval_pattern(&lines, idx)
            {
                continue;
            }
            violations.push(Violation {
                path: file.path.clone(),
                line: idx + 1,
                reason: "Sleep in production code",
                text: line.trim().to_string(),
            });
        }
    }
    violations
}

/// Blocking I/O inside async functions
pub fn find_blocking_io_violations(files: &[SourceFile]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for file in files {
        let lines = file.lines();
        for (idx, line) in lines.iter().enumerate() {
            if is_in_test_function(&lines, idx) || is_in_non_async_function(&lines, idx) {
                continue;
            }
            if let Some(reason) = blocking_io_reason(code_part(line), &lines, idx) {
                violations.push(Violation {
                    path: file.path.clone(),
                    line: idx + 1,
                    reason,
                    text: line.trim().to_string(),
                });
            }
        }
    }
    violations
}

fn blocking_io_reason(code: &str, lines: &[&str], idx: usize) -> Option<&'static str> {
    if code.contains("std::fs::") || code.contains("use std::fs") {
        return Some("Blocking file I/O");
    }
    if code.contains("std::net::") || code.contains("use std::net") {
        return Some("Blocking network I/O");
    }
    if code.contains("std::process::Command") {
        return Some("Blocking process I/O");
    }
    if code.contains("reqwest::blocking") {
        return Some("Blocking HTTP client");
    }
    if (code.contains("std::io::stdin()") || code.contains("std::io::stdout()"))
        && is_in_async_function(lines, idx)
    {
        return Some("Blocking stdin/stdout in async");
    }
    None
}

// ============================================================================
// Context Detection
// ============================================================================

/// `Some(is_async)` if the line starts a function definition
fn fn_signature(line: &str) -> Option<bool> {
    let mut rest = line.trim();
    for prefix in ["pub(crate) ", "pub(super) ", "pub "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    let is_async = rest.starts_with("async ");
    if let Some(stripped) = rest.strip_prefix("async ") {
        rest = stripped;
    }
    rest.starts_with("fn ").then_some(is_async)
}

fn is_boundary(line: &str) -> bool {
    let line = line.trim();
    line.starts_with("mod ")
        || line.starts_with("pub mod ")
        || ((line.starts_with("impl ") || line.starts_with("impl<")) && line.contains('{'))
}

/// Index of the nearest enclosing function signature, if any
fn enclosing_fn(lines: &[&str], current_idx: usize) -> Option<usize> {
    for i in (0..=current_idx).rev() {
        if fn_signature(lines[i]).is_some() {
            return Some(i);
        }
        if is_boundary(lines[i]) {
            return None;
        }
    }
    None
}

/// Whether the line sits in a `#[test]` / `#[tokio::test]` function
pub fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    let Some(fn_idx) = enclosing_fn(lines, current_idx) else {
        return false;
    };
    for line in lines[..fn_idx].iter().rev() {
        let line = line.trim();
        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            return true;
        }
        if !line.starts_with("#[") && !line.starts_with("///") {
            break;
        }
    }
    false
}

/// Whether the enclosing function is `async`
pub fn is_in_async_function(lines: &[&str], current_idx: usize) -> bool {
    enclosing_fn(lines, current_idx)
        .and_then(|i| fn_signature(lines[i]))
        .unwrap_or(false)
}

/// Whether the enclosing function is a plain (blocking-allowed) function
pub fn is_in_non_async_function(lines: &[&str], current_idx: usize) -> bool {
    enclosing_fn(lines, current_idx)
        .and_then(|i| fn_signature(lines[i]))
        .is_some_and(|is_async| !is_async)
}

/// Retry backoff: "backoff" nearby, or a retry/attempt next to a delay
pub fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    let range = current_idx.saturating_sub(15)..(current_idx + 5).min(lines.len());

    let mut has_backoff = false;
    let mut has_retry = false;
    let mut has_delay = false;
    for line in &lines[range] {
        let line = line.to_lowercase();
        has_backoff |= line.contains("backoff") || line.contains("backing off");
        has_retry |= line.contains("retry") || line.contains("attempt");
        has_delay |= line.contains("delay");
    }
    has_backoff || (has_retry && has_delay)
}

/// Periodic work driven by `tokio::time::interval`
pub fn is_interval_pattern(lines: &[&str], current_idx: usize) -> bool {
    let before = current_idx.saturating_sub(20)..current_idx;
    let after = current_idx..(current_idx + 5).min(lines.len());
    lines[before]
        .iter()
        .any(|l| l.contains("interval.tick()") || l.contains("tokio::time::interval"))
        || lines[after].iter().any(|l| l.contains("interval.tick()"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_outside_backoff_is_flagged() {
        let file = SourceFile::new(
            "poller.rs",
            "async fn poll() {\n    loop {\n        tokio::time::sleep(Duration::from_millis(10)).await;\n    }\n}\n",
        );
        let violations = find_sleep_violations(&[file]);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 3);
    }

    #[test]
    fn test_backoff_detection() {
        let code = [
            "async fn call_with_retry() {",
            "    let delay = policy.next_delay(attempt);",
            "    tokio::time::sleep(delay).await;",
            "}",
        ];
        assert!(is_backoff_context(&code, 2));
        assert!(!is_backoff_context(&["async fn f() {", "    sleep(x).await;", "}"], 1));
    }

    #[test]
    fn test_function_kinds() {
        let code = [
            "impl Loader {",
            "    pub fn load(path: &Path) -> String {",
            "        std::fs::read_to_string(path).unwrap_or_default()",
            "    }",
            "    pub(crate) async fn fetch(&self) {",
            "        let _ = std::fs::read(\"x\");",
            "    }",
            "}",
        ];
        assert!(is_in_non_async_function(&code, 2));
        assert!(!is_in_async_function(&code, 2));
        assert!(is_in_async_function(&code, 5));
        assert!(!is_in_non_async_function(&code, 5));

        let file = SourceFile::new("loader.rs", &code.join("\n"));
        let violations = find_blocking_io_violations(&[file]);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 6);
        assert_eq!(violations[0].reason, "Blocking file I/O");
    }

    #[test]
    fn test_test_function_detection() {
        let code = [
            "#[tokio::test]",
            "async fn test_something() {",
            "    tokio::time::sleep(Duration::from_millis(5)).await;",
            "}",
        ];
        assert!(is_in_test_function(&code, 2));
        assert!(find_sleep_violations(&[SourceFile::new("t.rs", &code.join("\n"))]).is_empty());
    }

    #[test]
    fn test_test_module_is_dropped() {
        let file = SourceFile::new(
            "m.rs",
            "pub fn a() {}\n\n#[cfg(test)]\nmod tests {\n    fn b() {}\n}\n",
        );
        assert_eq!(file.lines(), ["pub fn a() {}"]);

        // a cfg(test) item that is not the test module stays
        let file = SourceFile::new("m.rs", "#[cfg(test)]\npub mod test_utils;\npub use a::B;\n");
        assert_eq!(file.lines().len(), 3);
    }
}
