//! SHA-256 digests of render inputs and outputs.

use sha2::{Digest, Sha256};

use crate::render::GraphicFormat;

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Identifies one render: the same input, format, size and engine give
/// the same hash.
/// render_hash = sha256(sha256(input) + format + width + height + engine_version)
pub fn compute_render_hash(
    input: &[u8],
    format: GraphicFormat,
    width: i32,
    height: i32,
    engine_version: &str,
) -> String {
    let combined = format!(
        "{}:{}:{}:{}:{}",
        sha256_hex(input),
        format.extension(),
        width.max(0),
        height.max(0),
        engine_version
    );
    sha256_hex(combined.as_bytes())
}
