use std::path::{Path, PathBuf};

/// Longest component we keep, in bytes. Leaves room under the common 255-byte
/// name limit for the `{page}_{seq}_` prefix, a collision suffix and `.part`.
const MAX_COMPONENT_BYTES: usize = 180;

/// Make a tag or author name safe as a single path component.
///
/// Characters invalid on common filesystems (`/`, `\`, `:`, `*`, `?`, `"`,
/// `<`, `>`, `|`) and control characters become `_`. Surrounding whitespace
/// and dots are trimmed; an empty result becomes `unknown`.
pub fn sanitize_component(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control()
            {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = replaced.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    let mut end = trimmed.len().min(MAX_COMPONENT_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].trim_end().to_string()
}

/// Extension-less output name: `{page}_{sequence}_{author}`.
pub fn target_stem(page: u32, sequence_index: u32, author: &str) -> String {
    format!("{}_{}_{}", page, sequence_index, sanitize_component(author))
}

/// Directory holding a tag's images, ledger and failure journal.
pub fn tag_dir(save_root: &Path, tag: &str) -> PathBuf {
    save_root.join(sanitize_component(tag))
}

/// Final on-disk path for a stem and the extension chosen by the resolver.
pub fn final_path(directory: &Path, stem: &str, extension: &str) -> PathBuf {
    directory.join(format!("{stem}.{extension}"))
}

/// Add a suffix to a stem: `1_2_alice` with `123` becomes `1_2_alice-123`.
pub fn insert_suffix(stem: &str, suffix: &str) -> String {
    format!("{stem}-{}", sanitize_component(suffix))
}
