/// Running CRC32 over the bytes streamed into the current object.
///
/// Feeding the same bytes in one call or in many produces the same value.
#[derive(Debug, Clone, Default)]
pub struct Crc32Accumulator {
    value: u32,
}

impl Crc32Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulator that continues from a checksum the target already holds.
    pub fn with_initial(value: u32) -> Self {
        Self { value }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        let mut h = crc32fast::Hasher::new_with_initial(self.value);
        h.update(bytes);
        self.value = h.finalize();
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }

    /// Restart from a committed checksum instead of zero.
    pub fn reset_to(&mut self, value: u32) {
        self.value = value;
    }
}
