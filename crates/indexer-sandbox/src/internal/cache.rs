use std::fmt::Write as _;

use sha2::{Digest, Sha256};

/// Identity of a compiled dispatch program: the module it loads and the exact
/// source that was evaluated.
pub fn artifact_key(name: &str, source: &str) -> String {
    let mut h = Sha256::new();
    h.update(b"indexer-sandbox-artifact-v1\0");
    h.update(name.as_bytes());
    h.update([0]);
    h.update(source.as_bytes());

    let digest = h.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}
