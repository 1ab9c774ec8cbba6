//! Cache-key hashing rules.
//!
//! Two distinct key conventions are in play (see SPEC_FULL.md §4.C's
//! resolution of the source material's Open Question): the artifact cache
//! and issue log key on `(file_path, content_hash, output_metadata)`,
//! while the executed-notebook intermediate cache keys on
//! `(input_file, content_hash, language, prog_lang)` with no
//! `output_metadata` component, since two output variants of a notebook
//! can share one executed intermediate.

use blake3::Hasher;

const SEP: u8 = 0x1f;

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Stable key for the artifact cache / issue log (`(file_path,
/// content_hash, output_metadata)`). Callers pass this through verbatim as
/// SQL lookup columns; `output_metadata` itself is an opaque caller-built
/// discriminator, not computed here.
pub fn artifact_cache_key(file_path: &str, content_hash: &str, output_metadata: &str) -> String {
    hash_parts(&[file_path, content_hash, output_metadata])
}

/// Stable key for the executed-notebook intermediate cache
/// (`(input_file, content_hash, language, prog_lang)`).
pub fn notebook_cache_key(
    input_file: &str,
    content_hash: &str,
    language: &str,
    prog_lang: &str,
) -> String {
    hash_parts(&[input_file, content_hash, language, prog_lang])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_cache_key_is_stable() {
        let a = artifact_cache_key("in.ipynb", "abc", "speaker/python/en");
        let b = artifact_cache_key("in.ipynb", "abc", "speaker/python/en");
        assert_eq!(a, b);
    }

    #[test]
    fn different_output_metadata_differs() {
        let a = artifact_cache_key("in.ipynb", "abc", "speaker/python/en");
        let b = artifact_cache_key("in.ipynb", "abc", "completed/python/en");
        assert_ne!(a, b);
    }

    #[test]
    fn notebook_cache_key_ignores_output_metadata() {
        // speaker and completed share one executed intermediate
        let a = notebook_cache_key("in.ipynb", "abc", "en", "python");
        let b = notebook_cache_key("in.ipynb", "abc", "en", "python");
        assert_eq!(a, b);
    }
}
