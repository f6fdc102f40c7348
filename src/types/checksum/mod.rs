#![forbid(unsafe_code)]

//! CRC32 (IEEE) helpers shared by the WAL frames and the meta page.

/// Streaming CRC32 accumulator for records assembled from several slices.
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    /// Starts an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `bytes` and returns `self` for chaining.
    pub fn feed(mut self, bytes: &[u8]) -> Self {
        self.hasher.update(bytes);
        self
    }

    /// Checksum of everything fed so far.
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

/// CRC32 over the concatenation of `chunks`.
pub fn crc32(chunks: &[&[u8]]) -> u32 {
    chunks
        .iter()
        .fold(Crc32::new(), |acc, chunk| acc.feed(chunk))
        .value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_is_order_sensitive() {
        let partial = Crc32::new().feed(b"hello");
        let whole = partial.clone().feed(b" world");
        assert_ne!(partial.value(), whole.value());
        assert_eq!(whole.value(), crc32(&[b"hello world"]));
        assert_ne!(crc32(&[b"ab", b"cd"]), crc32(&[b"cd", b"ab"]));
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        assert_eq!(crc32(&[b"ab", b"cd"]), crc32(&[b"abcd"]));
        assert_eq!(crc32(&[b"", b"abcd", b""]), crc32(&[b"abcd"]));
    }
}
