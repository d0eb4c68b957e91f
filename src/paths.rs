//! Logical path normalization and the content-hash directory fan-out.

/// Normalize a logical path for storage lookups.
///
/// Separators are unified to `/`, empty and `.` segments are dropped, and
/// `..` pops the previous segment (it can never climb above the root). The
/// root itself normalizes to the empty string.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split(['/', '\\']) {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            seg => parts.push(seg),
        }
    }
    parts.join("/")
}

/// Join a parent logical path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Base name of a logical path; `/` for the root.
pub fn base_name(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((_, name)) => name,
        None if path.is_empty() => "/",
        None => path,
    }
}

/// Map a hash string onto a multi-level directory path.
///
/// Three two-character levels spread objects across 256^3 leaf directories,
/// which keeps leaves small at billion-object scale:
/// `hash_path("abc123def456")` → `"ab/c1/23/abc123def456"`.
///
/// Hashes shorter than six characters are returned as-is.
pub fn hash_path(hash: &str) -> String {
    if hash.len() < 6 {
        return hash.to_string();
    }
    format!("{}/{}/{}/{}", &hash[0..2], &hash[2..4], &hash[4..6], hash)
}

/// Like [`hash_path`], with a file extension appended to the leaf name.
pub fn hash_path_with_ext(hash: &str, ext: &str) -> String {
    if hash.len() < 6 {
        return format!("{hash}{ext}");
    }
    format!("{}/{}/{}/{}{}", &hash[0..2], &hash[2..4], &hash[4..6], hash, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/"), "");
        assert_eq!(clean_path(""), "");
        assert_eq!(clean_path("."), "");
        assert_eq!(clean_path("/a/b.txt"), "a/b.txt");
        assert_eq!(clean_path("a//b/./c"), "a/b/c");
        assert_eq!(clean_path("a/b/../c"), "a/c");
        assert_eq!(clean_path("../../a"), "a");
        assert_eq!(clean_path("a\\b\\c"), "a/b/c");
    }

    #[test]
    fn test_join_and_base() {
        assert_eq!(join_path("", "x.txt"), "x.txt");
        assert_eq!(join_path("a/b", "x.txt"), "a/b/x.txt");
        assert_eq!(base_name("a/b/x.txt"), "x.txt");
        assert_eq!(base_name("x.txt"), "x.txt");
        assert_eq!(base_name(""), "/");
    }

    #[test]
    fn test_hash_path() {
        assert_eq!(hash_path("abc123def456"), "ab/c1/23/abc123def456");
        assert_eq!(hash_path("abc"), "abc");
        assert_eq!(
            hash_path_with_ext("abc123def456", ".json"),
            "ab/c1/23/abc123def456.json"
        );
        assert_eq!(hash_path_with_ext("abc", ".json"), "abc.json");
    }
}
