//! Deterministic hashing for the task runner.
//!
//! Two distinct digests live here:
//! - [`hash_file`] produces git-compatible blob hashes for file contents, so
//!   fingerprints agree with what a git index would record for the same
//!   bytes.
//! - [`TurboHash`] hashes structured values. Implementors serialize
//!   themselves through [`CanonicalHasher`], which writes a tagged,
//!   length-prefixed byte form with all map keys sorted, then folds the
//!   bytes through xxh64 and renders 16 lowercase hex characters.

mod file;

pub use file::{Error, FileHashes, hash_file, hash_files};
use xxhash_rust::xxh64::Xxh64;

/// A value with a stable, platform-independent 16-hex-character digest.
pub trait TurboHash {
    fn write(&self, hasher: &mut CanonicalHasher);

    fn hash(&self) -> String {
        let mut hasher = CanonicalHasher::new();
        self.write(&mut hasher);
        hasher.finish()
    }
}

/// Canonical serializer feeding xxh64.
///
/// Fields must be written in declared order. Every value is prefixed with a
/// one-byte tag and, where variable-length, a little-endian u64 length, so
/// that adjacent fields can never collide by concatenation.
pub struct CanonicalHasher {
    state: Xxh64,
}

impl CanonicalHasher {
    pub fn new() -> Self {
        Self {
            state: Xxh64::new(0),
        }
    }

    fn tag(&mut self, tag: u8) {
        self.state.update(&[tag]);
    }

    pub fn add_str(&mut self, value: &str) {
        self.tag(b's');
        self.state.update(&(value.len() as u64).to_le_bytes());
        self.state.update(value.as_bytes());
    }

    pub fn add_u64(&mut self, value: u64) {
        self.tag(b'u');
        self.state.update(&value.to_le_bytes());
    }

    pub fn add_bool(&mut self, value: bool) {
        self.tag(b'b');
        self.state.update(&[value as u8]);
    }

    /// Absent optional fields hash differently from empty ones.
    pub fn add_option_str(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                self.tag(b'S');
                self.add_str(value);
            }
            None => self.tag(b'n'),
        }
    }

    pub fn add_str_slice<S: AsRef<str>>(&mut self, values: &[S]) {
        self.tag(b'l');
        self.state.update(&(values.len() as u64).to_le_bytes());
        for value in values {
            self.add_str(value.as_ref());
        }
    }

    /// Writes map entries sorted by key.
    pub fn add_map<'a, I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (&'a K, &'a V)>,
        K: AsRef<str> + 'a + ?Sized,
        V: AsRef<str> + 'a + ?Sized,
    {
        let mut entries: Vec<(&str, &str)> = entries
            .into_iter()
            .map(|(k, v)| (k.as_ref(), v.as_ref()))
            .collect();
        entries.sort_unstable();
        self.tag(b'm');
        self.state.update(&(entries.len() as u64).to_le_bytes());
        for (key, value) in entries {
            self.add_str(key);
            self.add_str(value);
        }
    }

    pub fn finish(self) -> String {
        let mut buf = [0u8; 16];
        hex_encode_u64(self.state.digest(), &mut buf).to_owned()
    }
}

impl Default for CanonicalHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex-encodes a u64 into a fixed stack buffer, avoiding the intermediate
/// allocation `hex::encode` would perform.
fn hex_encode_u64(value: u64, buf: &mut [u8; 16]) -> &str {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    for (i, byte) in value.to_be_bytes().iter().enumerate() {
        buf[i * 2] = HEX_CHARS[(byte >> 4) as usize];
        buf[i * 2 + 1] = HEX_CHARS[(byte & 0x0f) as usize];
    }
    // SAFETY: buf holds only ASCII hex characters
    unsafe { std::str::from_utf8_unchecked(buf) }
}
