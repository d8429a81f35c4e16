//! Random tokens for realm suffixes and database credentials.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Realm id suffix length
pub const REALM_SUFFIX_LEN: usize = 6;
/// Database user suffix length
pub const DB_USER_SUFFIX_LEN: usize = 4;
/// Database password length
pub const DB_PASSWORD_LEN: usize = 10;

/// Alphanumeric token generator owning its RNG.
///
/// Seeded once from the operating system; tests seed it explicitly to get
/// reproducible tokens.
#[derive(Debug)]
pub struct TokenGenerator {
    rng: StdRng,
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl TokenGenerator {
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A token of `len` characters drawn from `[a-zA-Z0-9]`
    pub fn token(&mut self, len: usize) -> String {
        (0..len)
            .map(|_| char::from(ALPHABET[self.rng.gen_range(0..ALPHABET.len())]))
            .collect()
    }
}
