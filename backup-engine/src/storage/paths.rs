//! Helpers for the `/`-separated, root-relative paths backends receive.

pub fn join(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

pub fn parent(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

fn components(path: &str) -> Option<Vec<&str>> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.iter().any(|p| *p == "." || *p == "..") {
        return None;
    }
    Some(parts)
}

/// Relative target for a symlink created at `link` that points at `target`.
///
/// Returns `None` when no relative path can be derived; callers fall back to
/// storing an independent copy.
pub fn relative_link(link: &str, target: &str) -> Option<String> {
    let link_parts = components(link)?;
    let target_parts = components(target)?;
    let (_, link_dir) = link_parts.split_last()?;
    if target_parts.is_empty() || link_parts == target_parts {
        return None;
    }

    let common = link_dir
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel: Vec<&str> = vec![".."; link_dir.len() - common];
    rel.extend_from_slice(&target_parts[common..]);
    Some(rel.join("/"))
}
