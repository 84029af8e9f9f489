//! Utility functions for file operations, naming and verification

use crate::config::FileCollisionAction;
use crate::error::{Error, Result};
use crate::types::{Checksum, ReleaseRequest};
use regex::Regex;
use sha2::Digest;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::io::AsyncReadExt;

/// Maximum number of rename attempts when resolving file collisions
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Longest filename component we produce (leaves room for " (n).ext")
const MAX_FILENAME_LEN: usize = 245;

/// Tokens understood by naming templates, longest first so partial names never win
const TEMPLATE_TOKENS: &[&str] = &["author", "format", "title", "year"];

static BRACE_BLOCK: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\{([^}]+)\}").ok());

/// Repeated dash separators, and brackets left empty by missing tokens
static CLEANUP: LazyLock<Option<(Regex, Regex)>> = LazyLock::new(|| {
    Some((
        Regex::new(r"(\s*-\s*){2,}").ok()?,
        Regex::new(r"\(\s*\)|\[\s*\]").ok()?,
    ))
});

/// Get a unique path for a file, handling collisions according to the specified action
///
/// For Rename, `/tmp/book.epub` becomes `/tmp/book (1).epub`, then `(2)`, and so on.
/// For Skip, an existing file is an error. For Overwrite, the path is returned unchanged.
///
/// # Examples
///
/// ```
/// use shelf_dl::utils::get_unique_path;
/// use shelf_dl::config::FileCollisionAction;
/// use std::path::Path;
///
/// let path = Path::new("/tmp/shelf-dl-doc-example.epub");
/// let unique = get_unique_path(path, FileCollisionAction::Rename).unwrap();
/// assert!(unique.to_string_lossy().ends_with(".epub"));
/// ```
pub fn get_unique_path(path: &Path, action: FileCollisionAction) -> Result<PathBuf> {
    match action {
        FileCollisionAction::Overwrite => Ok(path.to_path_buf()),
        FileCollisionAction::Skip => {
            if path.exists() {
                return Err(Error::FileCollision {
                    path: path.to_path_buf(),
                    reason: "File already exists and collision action is Skip".to_string(),
                });
            }
            Ok(path.to_path_buf())
        }
        FileCollisionAction::Rename => {
            if !path.exists() {
                return Ok(path.to_path_buf());
            }

            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Error::FileCollision {
                    path: path.to_path_buf(),
                    reason: "Cannot extract file stem".to_string(),
                })?;

            let extension = path.extension().and_then(|e| e.to_str());

            let parent = path.parent().ok_or_else(|| Error::FileCollision {
                path: path.to_path_buf(),
                reason: "Cannot extract parent directory".to_string(),
            })?;

            for i in 1..=MAX_RENAME_ATTEMPTS {
                let new_name = match extension {
                    Some(ext) => format!("{} ({}).{}", stem, i, ext),
                    None => format!("{} ({})", stem, i),
                };
                let new_path = parent.join(new_name);
                if !new_path.exists() {
                    return Ok(new_path);
                }
            }

            Err(Error::FileCollision {
                path: path.to_path_buf(),
                reason: "Could not find unique filename after 9999 attempts".to_string(),
            })
        }
    }
}

/// Make a string safe to use as a single path component
///
/// Replaces `\ / : * ? " < > |` with `_`, collapses runs of underscores, trims
/// surrounding whitespace and dots, and truncates to 245 characters.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let mut collapsed = String::with_capacity(replaced.len());
    for c in replaced.chars() {
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }

    let trimmed = collapsed.trim_matches(|c: char| c.is_whitespace() || c == '.');
    trimmed.chars().take(MAX_FILENAME_LEN).collect()
}

/// Render a naming template against a request
///
/// `{Title}` is replaced by the title. Text inside a brace block around a token is
/// kept only when the token has a value, so `{Author - }{Title}` renders as
/// `Frank Herbert - Dune` or just `Dune`. Tokens are `Author`, `Title`, `Year` and
/// `Format`; matching is case-insensitive and blocks without a token are kept as
/// written. Separators and brackets orphaned by empty tokens are removed.
#[must_use]
pub fn render_template(template: &str, request: &ReleaseRequest, format: Option<&str>) -> String {
    let (Some(pattern), Some(cleanup)) = (BRACE_BLOCK.as_ref(), CLEANUP.as_ref()) else {
        return request.title.clone();
    };

    let value_for = |token: &str| -> Option<String> {
        let value = match token {
            "author" => request.author.clone(),
            "title" => Some(request.title.clone()),
            "year" => request.year.clone(),
            "format" => format.map(str::to_string),
            _ => None,
        }?;
        let value = sanitize_filename(value.trim());
        (!value.is_empty()).then_some(value)
    };

    let rendered = pattern.replace_all(template, |caps: &regex::Captures<'_>| {
        let content = &caps[1];
        // ASCII lowering keeps byte offsets aligned with `content`
        let lower = content.to_ascii_lowercase();
        for token in TEMPLATE_TOKENS {
            if let Some(idx) = lower.find(token) {
                return match value_for(token) {
                    Some(value) => {
                        let prefix = &content[..idx];
                        let suffix = &content[idx + token.len()..];
                        format!("{}{}{}", prefix, value, suffix)
                    }
                    None => String::new(),
                };
            }
        }
        caps[0].to_string()
    });

    let (dashes, empty_brackets) = cleanup;
    let result = empty_brackets.replace_all(&rendered, "");
    let result = dashes.replace_all(&result, " - ");
    let result = result.trim_matches(|c: char| c.is_whitespace() || matches!(c, '-' | '_' | '.'));
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Final filename for a promoted file
///
/// Renders the template, falls back to the source's suggested name and then to
/// `download`, sanitizes it, and appends the format extension when missing.
#[must_use]
pub fn final_filename(
    template: &str,
    request: &ReleaseRequest,
    suggested: Option<&str>,
    format: Option<&str>,
) -> String {
    let suggested_stem = suggested.map(|s| {
        Path::new(s)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(s)
            .to_string()
    });
    let extension = format
        .map(|f| f.trim_start_matches('.').to_lowercase())
        .or_else(|| {
            suggested
                .and_then(|s| Path::new(s).extension())
                .and_then(|e| e.to_str())
                .map(str::to_lowercase)
        })
        .filter(|e| !e.is_empty());

    let mut stem = sanitize_filename(&render_template(template, request, extension.as_deref()));
    if stem.is_empty() {
        stem = suggested_stem
            .map(|s| sanitize_filename(&s))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "download".to_string());
    }

    match extension {
        Some(ext) => format!("{}.{}", stem, sanitize_filename(&ext)),
        None => stem,
    }
}

/// Extract a filename from an HTTP response
///
/// Tries the Content-Disposition header (`filename=` and RFC 5987 `filename*=`),
/// then the last URL path segment. Returns `None` when neither yields a name.
pub fn filename_from_response(response: &reqwest::Response) -> Option<String> {
    if let Some(content_disposition) = response.headers().get(reqwest::header::CONTENT_DISPOSITION)
        && let Ok(value) = content_disposition.to_str()
        && let Some(name) = filename_from_disposition(value)
    {
        return Some(name);
    }

    response
        .url()
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
}

fn filename_from_disposition(value: &str) -> Option<String> {
    // Format: attachment; filename="file.epub" or filename*=UTF-8''file.epub
    let mut plain = None;
    for part in value.split(';') {
        let part = part.trim();
        if let Some(encoded) = part.strip_prefix("filename*=") {
            // charset'lang'encoded-filename; preferred over the plain form
            if let Some(idx) = encoded.rfind('\'')
                && let Ok(decoded) = urlencoding::decode(&encoded[idx + 1..])
            {
                return Some(decoded.into_owned());
            }
        } else if let Some(name) = part.strip_prefix("filename=") {
            let name = name.trim_matches('"');
            if !name.is_empty() {
                plain = Some(name.to_string());
            }
        }
    }
    plain
}

/// Verify a file against an advertised checksum, reading it in chunks
///
/// Returns `Ok(false)` on mismatch. Hex comparison is case-insensitive.
pub async fn verify_checksum(path: &Path, checksum: &Checksum) -> Result<bool> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; 64 * 1024];

    let (actual, expected) = match checksum {
        Checksum::Md5(expected) => {
            let mut ctx = md5::Context::new();
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                ctx.consume(&buf[..n]);
            }
            (format!("{:x}", ctx.compute()), expected)
        }
        Checksum::Sha256(expected) => {
            let mut hasher = sha2::Sha256::new();
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            (format!("{:x}", hasher.finalize()), expected)
        }
    };

    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_get_unique_path_nonexistent_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("book.epub");

        assert_eq!(
            get_unique_path(&path, FileCollisionAction::Rename).unwrap(),
            path
        );
        assert_eq!(
            get_unique_path(&path, FileCollisionAction::Overwrite).unwrap(),
            path
        );
        assert_eq!(
            get_unique_path(&path, FileCollisionAction::Skip).unwrap(),
            path
        );
    }

    #[test]
    fn test_get_unique_path_rename_with_extension() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("book.epub");
        fs::write(&path, "original").unwrap();

        let unique = get_unique_path(&path, FileCollisionAction::Rename).unwrap();
        assert_eq!(unique, temp_dir.path().join("book (1).epub"));

        fs::write(&unique, "first rename").unwrap();
        let unique2 = get_unique_path(&path, FileCollisionAction::Rename).unwrap();
        assert_eq!(unique2, temp_dir.path().join("book (2).epub"));
    }

    #[test]
    fn test_get_unique_path_skip_existing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("book.epub");
        fs::write(&path, "original").unwrap();

        match get_unique_path(&path, FileCollisionAction::Skip) {
            Err(Error::FileCollision { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected FileCollision error, got {other:?}"),
        }
    }

    #[test]
    fn test_get_unique_path_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("book.epub");
        fs::write(&path, "original").unwrap();

        let result = get_unique_path(&path, FileCollisionAction::Overwrite).unwrap();
        assert_eq!(result, path);
    }

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize_filename("AC/DC: Live?"), "AC_DC_ Live_");
        assert_eq!(sanitize_filename("a//b"), "a_b");
        assert_eq!(sanitize_filename("  ..hidden.. "), "hidden");
        assert_eq!(sanitize_filename(""), "");
    }

    #[test]
    fn sanitize_truncates_long_names() {
        let long = "x".repeat(400);
        assert_eq!(sanitize_filename(&long).len(), 245);
    }

    #[test]
    fn template_drops_affixes_for_missing_values() {
        let mut request = ReleaseRequest::new("Dune");
        assert_eq!(render_template("{Author - }{Title}", &request, None), "Dune");

        request.author = Some("Frank Herbert".into());
        assert_eq!(
            render_template("{Author - }{Title}", &request, None),
            "Frank Herbert - Dune"
        );

        request.year = Some("1965".into());
        assert_eq!(
            render_template("{Title}{ (Year)}", &request, None),
            "Dune (1965)"
        );
    }

    #[test]
    fn template_is_case_insensitive_and_cleans_orphans() {
        let request = ReleaseRequest::new("Dune");
        assert_eq!(
            render_template("{TITLE}{Publisher}", &request, None),
            "Dune{Publisher}"
        );
        assert_eq!(
            render_template("{Author} - {Title} ({Year})", &request, None),
            "Dune"
        );
        assert_eq!(render_template("Book: {title}", &request, None), "Book: Dune");
        assert_eq!(
            render_template("{Title}{ [Format]}", &request, Some("epub")),
            "Dune [epub]"
        );
    }

    #[test]
    fn final_filename_appends_format_and_falls_back() {
        let mut request = ReleaseRequest::new("Dune: Messiah");
        request.author = Some("Frank Herbert".into());
        assert_eq!(
            final_filename("{Author - }{Title}", &request, None, Some("EPUB")),
            "Frank Herbert - Dune_ Messiah.epub"
        );

        let empty = ReleaseRequest::default();
        assert_eq!(
            final_filename("{Title}", &empty, Some("abc123.mobi"), None),
            "abc123.mobi"
        );
        assert_eq!(final_filename("{Title}", &empty, None, None), "download");
    }

    #[test]
    fn disposition_prefers_encoded_filename() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"plain.epub\""),
            Some("plain.epub".to_string())
        );
        assert_eq!(
            filename_from_disposition(
                "attachment; filename=\"fallback.epub\"; filename*=UTF-8''D%C3%BCne.epub"
            ),
            Some("Düne.epub".to_string())
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[tokio::test]
    async fn filename_from_response_uses_header_then_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/with-header"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Disposition", "attachment; filename=\"Real.epub\""),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/Some%20Book.mobi"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let resp = reqwest::get(format!("{}/files/with-header", server.uri()))
            .await
            .unwrap();
        assert_eq!(filename_from_response(&resp), Some("Real.epub".into()));

        let resp = reqwest::get(format!("{}/files/Some%20Book.mobi", server.uri()))
            .await
            .unwrap();
        assert_eq!(filename_from_response(&resp), Some("Some Book.mobi".into()));
    }

    #[tokio::test]
    async fn checksum_verification_md5_and_sha256() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.bin");
        fs::write(&path, b"hello world").unwrap();

        let md5_ok = Checksum::Md5("5EB63BBBE01EEED093CB22BB8F5ACDC3".into());
        let sha_ok = Checksum::Sha256(
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9".into(),
        );
        let md5_bad = Checksum::Md5("00000000000000000000000000000000".into());

        assert!(verify_checksum(&path, &md5_ok).await.unwrap());
        assert!(verify_checksum(&path, &sha_ok).await.unwrap());
        assert!(!verify_checksum(&path, &md5_bad).await.unwrap());
    }
}
