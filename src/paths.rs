use crate::error::{Error, Result};

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_PATH_LEN: usize = 1024;

/// Checks a remote path: absolute, `/`-separated, no empty, `.` or `..`
/// segments, no trailing slash except on the root.
pub fn validate(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::invalid_path(format!("path must be absolute: {:?}", path)));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(Error::invalid_path(format!(
            "path is {} bytes, limit is {}",
            path.len(),
            MAX_PATH_LEN
        )));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(Error::invalid_path(format!("trailing slash in {:?}", path)));
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(Error::invalid_path(format!("empty segment in {:?}", path))),
            "." | ".." => {
                return Err(Error::invalid_path(format!(
                    "relative segment {:?} in {:?}",
                    segment, path
                )));
            }
            name => validate_name(name)?,
        }
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::invalid_name(format!("invalid name {:?}", name)));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(Error::invalid_name(format!("name {:?} contains a separator", name)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_name(format!(
            "name is {} bytes, limit is {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Every ancestor directory of `path`, root first, excluding `path` itself.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = vec![];
    let mut current = parent(path);
    while current != "/" {
        out.push(current.to_string());
        current = parent(current);
    }
    out.push("/".to_string());
    out.reverse();
    if path == "/" {
        out.clear();
    }
    out
}

pub fn is_within(path: &str, dir: &str) -> bool {
    dir == "/" || path == dir || path.starts_with(&format!("{}/", dir))
}
