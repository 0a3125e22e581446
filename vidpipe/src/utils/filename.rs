//! File name helpers for downloaded and generated artifacts.

/// Reduce a free-form title to something safe to embed in a file name.
///
/// Keeps alphanumerics (any script), spaces, `-` and `_`; everything else is
/// dropped. Runs of spaces collapse to one and the result is trimmed.
pub fn sanitize_title(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_space = false;

    for c in input.chars() {
        if c.is_alphanumeric() || c == '-' || c == '_' {
            result.push(c);
            last_was_space = false;
        } else if c == ' ' && !last_was_space {
            result.push(' ');
            last_was_space = true;
        }
    }

    result.trim().to_string()
}

/// Extension of the last URL path segment, without the dot.
pub fn extension_from_url(url: &url::Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// File name of the last URL path segment.
pub fn file_name_from_url(url: &url::Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    (!last.is_empty()).then(|| last.to_string())
}
