// External crates
use glob::Pattern;
use std::path::PathBuf;
use tracing::warn;

/// Expand a glob pattern to the matching paths, dropping any that match
/// one of the exclude patterns. Excludes are matched against both the
/// bare file name and the full path, so `*.gz` and `/var/log/*.gz` both
/// work. Paths that fail to read mid-walk are skipped.
pub fn eglob(pattern: &str, excludes: &[String]) -> Vec<PathBuf> {
    let exclude_patterns = compile_patterns(excludes);

    let entries = match glob::glob(pattern) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(pattern, error = %e, "Invalid glob pattern, skipping");
            return Vec::new();
        }
    };

    entries
        .filter_map(Result::ok)
        .filter(|path| !is_excluded(path, &exclude_patterns))
        .collect()
}

fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, error = %e, "Invalid exclude pattern, skipping");
                None
            }
        })
        .collect()
}

fn is_excluded(path: &PathBuf, excludes: &[Pattern]) -> bool {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    excludes
        .iter()
        .any(|p| p.matches(file_name) || p.matches_path(path))
}
