//! Keys of the stripe objects holding a file's data.
//!
//! A file's bytes are split into fixed-size stripes, each stored as its own object under
//! `{base}/{index}`. The index is packed into four bytes carrying seven bits each, with the high
//! bit of every byte forced on. No byte of the suffix can therefore be NUL, and keys of one file
//! sort in stripe order.

/// Separates the base key from the packed stripe index.
pub const SEPARATOR: u8 = b'/';

/// Number of stripe indices the four-byte suffix can address.
pub const STRIPE_COUNT_LIMIT: u64 = 1 << 28;

const INDEX_BYTES: usize = 4;

/// Packs a stripe index, most significant group first.
#[must_use]
pub fn encode_index(index: u32) -> [u8; INDEX_BYTES] {
    debug_assert!(u64::from(index) < STRIPE_COUNT_LIMIT);
    let mut out = [0u8; INDEX_BYTES];
    for (i, byte) in out.iter_mut().enumerate() {
        let shift = 7 * (INDEX_BYTES - 1 - i);
        #[expect(clippy::cast_possible_truncation, reason = "masked to seven bits")]
        let group = ((index >> shift) & 0x7f) as u8;
        *byte = 0x80 | group;
    }
    out
}

/// Inverse of [`encode_index`].
#[must_use]
pub fn decode_index(packed: [u8; INDEX_BYTES]) -> u32 {
    packed
        .iter()
        .fold(0u32, |acc, byte| (acc << 7) | u32::from(byte & 0x7f))
}

/// A reusable key buffer for walking the stripes of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeKey {
    buf: Vec<u8>,
}

impl StripeKey {
    /// Key of stripe `index` under `base`.
    #[must_use]
    pub fn new(base: &[u8], index: u32) -> Self {
        let mut buf = Vec::with_capacity(base.len() + 1 + INDEX_BYTES);
        buf.extend_from_slice(base);
        buf.push(SEPARATOR);
        buf.extend_from_slice(&encode_index(index));
        Self { buf }
    }

    /// Points this key at another stripe of the same base.
    pub fn set_index(&mut self, index: u32) {
        let start = self.buf.len() - INDEX_BYTES;
        self.buf[start..].copy_from_slice(&encode_index(index));
    }

    /// The stripe index this key addresses.
    #[must_use]
    pub fn index(&self) -> u32 {
        let mut packed = [0u8; INDEX_BYTES];
        packed.copy_from_slice(&self.buf[self.buf.len() - INDEX_BYTES..]);
        decode_index(packed)
    }

    /// The full key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl AsRef<[u8]> for StripeKey {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}
