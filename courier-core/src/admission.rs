//! File-type admission: only allow-listed extensions may be sent.

use std::path::Path;

/// Extensions eligible for transfer (compared case-insensitively).
pub const ALLOWED_EXTENSIONS: &[&str] = &["txt", "csv", "json", "7z", "zip", "gz", "lzma", "xz"];

/// Check whether a file name or path is eligible for transfer.
pub fn is_allowed(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            ALLOWED_EXTENSIONS
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Final path component, used as the filename announced in `FILE_START`.
pub fn announced_name(path: &Path) -> Option<String> {
    path.file_name()?.to_str().map(str::to_string)
}
