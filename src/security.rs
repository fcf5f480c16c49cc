//! Provenance, path, and input validation.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use url::Url;

use crate::error::{EngineError, FetchError};

static COMMIT_SHA: OnceLock<Regex> = OnceLock::new();
static FILE_NAME: OnceLock<Regex> = OnceLock::new();
static QUERY_CHARS: OnceLock<Regex> = OnceLock::new();
static DANGEROUS: OnceLock<Vec<Regex>> = OnceLock::new();

fn dangerous_patterns() -> &'static [Regex] {
    DANGEROUS.get_or_init(|| {
        [
            r"(?i)<script",
            r"(?i)javascript:",
            r"(?i)onerror=",
            r"(?i)onclick=",
            r"(?i)\bexec\b",
            r"(?i)\beval\b",
            r"__import__",
            r"\{\{.*\}\}",
            r"\$\{.*\}",
            r"\.\./",
            r"\.\.\\",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("query pattern must compile"))
        .collect()
    })
}

/// Validate a content-version token: 40 lowercase hex chars after trimming
/// and lower-casing.
pub fn validate_commit_sha(sha: &str) -> Result<String, FetchError> {
    let sha = sha.trim().to_lowercase();
    let re = COMMIT_SHA
        .get_or_init(|| Regex::new(r"^[a-f0-9]{40}$").expect("sha regex must compile"));
    if re.is_match(&sha) {
        Ok(sha)
    } else {
        Err(FetchError::InvalidVersion(sha))
    }
}

/// Parse `raw` and check its scheme is http(s) and its host is allow-listed.
pub fn validate_origin(raw: &str, allowed_hosts: &[String]) -> Result<Url, FetchError> {
    let url = Url::parse(raw).map_err(|e| FetchError::OriginNotAllowed(format!("{raw}: {e}")))?;

    if !matches!(url.scheme(), "https" | "http") {
        return Err(FetchError::OriginNotAllowed(raw.to_string()));
    }

    let host = url.host_str().unwrap_or_default();
    if !allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
        tracing::warn!(host, "blocked request to origin outside allow-list");
        return Err(FetchError::OriginNotAllowed(host.to_string()));
    }

    Ok(url)
}

/// Check a source file id is a bare file name with an allow-listed extension.
///
/// Rejects path separators, hidden files, and double extensions.
pub fn sanitize_file_id(file_id: &str, allowed_extensions: &[String]) -> Result<String, FetchError> {
    let re = FILE_NAME
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-.]+$").expect("file name regex must compile"));

    if file_id.is_empty()
        || !re.is_match(file_id)
        || file_id.starts_with('.')
        || file_id.matches('.').count() > 1
    {
        return Err(FetchError::PathTraversal(PathBuf::from(file_id)));
    }

    let allowed = allowed_extensions.iter().any(|ext| {
        let ext = ext.trim_start_matches('.');
        Path::new(file_id)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(ext))
    });
    if !allowed {
        return Err(FetchError::ExtensionNotAllowed(file_id.to_string()));
    }

    Ok(file_id.to_string())
}

/// Join `relative` onto `base`, refusing anything that could leave `base`.
///
/// The check is lexical, so it works for destinations that do not exist yet.
pub fn confine_path(base: &Path, relative: &Path) -> Result<PathBuf, FetchError> {
    let mut out = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                tracing::warn!(path = %relative.display(), "path traversal attempt");
                return Err(FetchError::PathTraversal(relative.to_path_buf()));
            }
        }
    }
    if !out.starts_with(base) || out == base {
        return Err(FetchError::PathTraversal(relative.to_path_buf()));
    }
    Ok(out)
}

/// Validate and normalize query text.
///
/// Collapses whitespace, bounds length, and rejects script, template, and
/// traversal patterns.
pub fn validate_query_text(query: &str, max_chars: usize) -> Result<String, EngineError> {
    if query.trim().is_empty() {
        return Err(EngineError::InvalidQuery("query must not be empty".into()));
    }
    if query.chars().count() > max_chars {
        return Err(EngineError::InvalidQuery(format!(
            "query exceeds maximum length of {max_chars} characters"
        )));
    }

    let sanitized = query.split_whitespace().collect::<Vec<_>>().join(" ");

    if dangerous_patterns().iter().any(|re| re.is_match(&sanitized)) {
        tracing::warn!("suspicious pattern in query");
        return Err(EngineError::InvalidQuery(
            "query contains potentially malicious content".into(),
        ));
    }

    let allowed = QUERY_CHARS.get_or_init(|| {
        Regex::new(r#"^[\w\s\-.,!?()'":/]+$"#).expect("query chars regex must compile")
    });
    if !allowed.is_match(&sanitized) {
        return Err(EngineError::InvalidQuery("query contains invalid characters".into()));
    }

    Ok(sanitized)
}

pub fn validate_top_k(top_k: usize, max_top_k: usize) -> Result<usize, EngineError> {
    if top_k == 0 || top_k > max_top_k {
        return Err(EngineError::InvalidQuery(format!(
            "top_k must be between 1 and {max_top_k}"
        )));
    }
    Ok(top_k)
}

/// Write `bytes` to `path` with owner-only permissions on Unix.
pub fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)?;
    set_private_permissions(path)
}

#[cfg(unix)]
pub fn set_private_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub fn set_private_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
