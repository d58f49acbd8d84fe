//! Path keys.
//!
//! A key is a forward-slash separated path relative to the sync root, with
//! no leading slash. Folder keys end with `/` so that a folder and a file of
//! the same name never collide. The sync root itself is `/`.

use std::path::Path;

use anyhow::{Context, Result};

pub const ROOT_KEY: &str = "/";

pub fn is_folder_key(key: &str) -> bool {
    key.ends_with('/')
}

/// Build the key of `full` relative to `base`.
pub fn relative_key(base: &Path, full: &Path, is_dir: bool) -> Result<String> {
    let rel = full
        .strip_prefix(base)
        .with_context(|| format!("{} is not under {}", full.display(), base.display()))?;

    let mut key = rel.to_string_lossy().replace('\\', "/");
    if key.is_empty() {
        return Ok(ROOT_KEY.to_string());
    }
    if is_dir {
        key.push('/');
    }
    Ok(key)
}

/// Ensure a folder key carries its trailing separator.
pub fn folder_key(key: &str) -> String {
    if is_folder_key(key) {
        key.to_string()
    } else {
        format!("{key}/")
    }
}

/// The folder containing `key`; `/` for entries at the root.
///
/// `"a/b/c.md"` → `"a/b/"`, `"a/b/"` → `"a/"`, `"a.md"` → `"/"`.
pub fn parent_folder(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/"),
        None => ROOT_KEY.to_string(),
    }
}

/// Like [`parent_folder`] but `None` when the parent is the sync root.
pub fn parent_path(key: &str) -> Option<String> {
    let parent = parent_folder(key);
    (parent != ROOT_KEY).then_some(parent)
}

/// Last path segment, without the folder separator.
pub fn file_name(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Every folder level of a folder key, shallowest first.
///
/// `"a/b/c/"` → `["a/", "a/b/", "a/b/c/"]`
pub fn folder_levels(key: &str) -> Vec<String> {
    let mut levels = Vec::new();
    let mut acc = String::new();
    for segment in key.split('/').filter(|s| !s.is_empty()) {
        acc.push_str(segment);
        acc.push('/');
        levels.push(acc.clone());
    }
    levels
}

/// Check whether a key matches any of the exclude glob patterns.
pub fn matches_exclude(key: &str, patterns: &[String]) -> bool {
    let path = key.trim_end_matches('/');
    patterns.iter().any(|p| glob_match(p, path))
}

/// Glob matching supporting `*`, `?` (single segment) and `**` (any depth).
fn glob_match(pattern: &str, path: &str) -> bool {
    if let Some((prefix, suffix)) = pattern.split_once("**") {
        let prefix = prefix.trim_end_matches('/');
        let suffix = suffix.trim_start_matches('/');
        let segments: Vec<&str> = path.split('/').collect();

        if prefix.is_empty() {
            // `**/foo`: suffix may appear at any depth
            return suffix.is_empty() || segments.iter().any(|s| simple_glob(suffix, s));
        }

        // `dir/**` or `dir/**/suffix`: some segment matches the prefix and
        // whatever follows it satisfies the suffix.
        return segments.iter().enumerate().any(|(i, segment)| {
            if !simple_glob(prefix, segment) {
                return false;
            }
            let rest = segments[i + 1..].join("/");
            suffix.is_empty()
                || simple_glob(suffix, &rest)
                || rest.split('/').any(|s| simple_glob(suffix, s))
        });
    }

    // Patterns without a separator match the file name only
    if !pattern.contains('/') {
        return simple_glob(pattern, file_name(path));
    }

    simple_glob(pattern, path)
}

/// Match a pattern with `*` and `?` wildcards against a string.
fn simple_glob(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_chars(&p, &t)
}

fn glob_chars(p: &[char], t: &[char]) -> bool {
    match p.split_first() {
        None => t.is_empty(),
        Some((&'*', rest)) => (0..=t.len()).any(|i| glob_chars(rest, &t[i..])),
        Some((&'?', rest)) => !t.is_empty() && glob_chars(rest, &t[1..]),
        Some((&c, rest)) => t.first() == Some(&c) && glob_chars(rest, &t[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_key_for_files_and_folders() {
        let base = Path::new("/home/user/sync");
        assert_eq!(
            relative_key(base, Path::new("/home/user/sync/docs/report.pdf"), false).unwrap(),
            "docs/report.pdf"
        );
        assert_eq!(
            relative_key(base, Path::new("/home/user/sync/docs"), true).unwrap(),
            "docs/"
        );
        assert_eq!(relative_key(base, base, true).unwrap(), ROOT_KEY);
        assert!(relative_key(base, Path::new("/elsewhere/x"), false).is_err());
    }

    #[test]
    fn parent_of_keys() {
        assert_eq!(parent_folder("a/b/c.md"), "a/b/");
        assert_eq!(parent_folder("a/b/"), "a/");
        assert_eq!(parent_folder("a/"), "/");
        assert_eq!(parent_folder("a.md"), "/");
        assert_eq!(parent_path("a/b/c.md").as_deref(), Some("a/b/"));
        assert_eq!(parent_path("a.md"), None);
        assert_eq!(parent_path("a/"), None);
    }

    #[test]
    fn names_and_levels() {
        assert_eq!(file_name("a/b/c.md"), "c.md");
        assert_eq!(file_name("a/b/"), "b");
        assert_eq!(
            folder_levels("a/b/c/"),
            vec!["a/".to_string(), "a/b/".to_string(), "a/b/c/".to_string()]
        );
        assert!(folder_levels("/").is_empty());
        assert_eq!(folder_key("a/b"), "a/b/");
        assert_eq!(folder_key("a/b/"), "a/b/");
    }

    #[test]
    fn exclude_glob_star() {
        assert!(matches_exclude("foo.tmp", &["*.tmp".into()]));
        assert!(!matches_exclude("foo.txt", &["*.tmp".into()]));
        assert!(matches_exclude("a/b/foo.tmp", &["*.tmp".into()]));
    }

    #[test]
    fn exclude_glob_doublestar() {
        assert!(matches_exclude("deep/nested/.git/config", &[".git/**".into()]));
        assert!(matches_exclude("node_modules/foo/bar.js", &["node_modules/**".into()]));
        assert!(matches_exclude("node_modules/", &["node_modules/**".into()]));
        assert!(!matches_exclude("src/main.rs", &["node_modules/**".into()]));
    }

    #[test]
    fn exclude_question_mark_and_full_path() {
        assert!(matches_exclude("notes/a1.md", &["notes/a?.md".into()]));
        assert!(!matches_exclude("notes/a12.md", &["notes/a?.md".into()]));
    }

    #[test]
    fn glob_with_combining_unicode() {
        let name = "Solidarita\u{308}tsanlass_24.2.2026.jpg";
        assert!(matches_exclude(name, &["*.jpg".into()]));
        assert!(!matches_exclude(name, &["*.png".into()]));
    }
}
