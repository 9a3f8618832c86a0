//! Slash-separated node path helpers

/// Path separator
pub const SEPARATOR: char = '/';

/// Join a parent path and a child name
pub fn join(parent: Option<&str>, name: &str) -> String {
    match parent {
        Some(p) if !p.is_empty() => format!("{}{}{}", p, SEPARATOR, name),
        _ => name.to_string(),
    }
}

/// Parent portion of a path, `None` for top-level paths
pub fn parent(path: &str) -> Option<&str> {
    path.rfind(SEPARATOR).map(|i| &path[..i])
}

/// Last segment of a path
pub fn leaf(path: &str) -> &str {
    path.rfind(SEPARATOR).map_or(path, |i| &path[i + 1..])
}

/// Number of segments
pub fn depth(path: &str) -> usize {
    path.matches(SEPARATOR).count() + 1
}

/// Rewrite `path` if it is `from` or lies under it.
///
/// `rebase("Root/Cube/Lid", "Root/Cube", "Root/Box")` gives
/// `Some("Root/Box/Lid")`; paths outside `from` give `None`.
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    if path == from {
        return Some(to.to_string());
    }
    let rest = path.strip_prefix(from)?;
    if rest.starts_with(SEPARATOR) {
        Some(format!("{}{}", to, rest))
    } else {
        None
    }
}
