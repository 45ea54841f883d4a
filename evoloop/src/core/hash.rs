//! Content addressing for candidates.

use sha2::{Digest, Sha256};

/// Stable identity for candidate content.
///
/// Line endings are normalized to `\n`, trailing whitespace is stripped from
/// each line, and trailing blank lines are dropped before hashing, so cosmetic
/// re-emissions of the same solution collapse to one identity.
pub fn content_hash(content: &str) -> String {
    let normalized = normalize(content);
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}

/// Short prefix used in log lines and file names.
pub fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

fn normalize(content: &str) -> String {
    let lines: Vec<&str> = content.lines().map(str::trim_end).collect();
    let end = lines
        .iter()
        .rposition(|line| !line.is_empty())
        .map_or(0, |idx| idx + 1);
    lines[..end].join("\n")
}
