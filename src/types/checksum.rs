#![forbid(unsafe_code)]

/// CRC32 over several discontiguous chunks.
pub fn crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_crc_matches_contiguous() {
        assert_eq!(crc32(&[b"hello", b" world"]), crc32(&[b"hello world"]));
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(crc32(&[]), 0);
    }
}
