//! Root password generation.
//!
//! Passwords embed every character of a seed (the owner's username) mixed
//! with random filler and shuffled. This is an obfuscation scheme for
//! per-tenant credentials, not a cryptographic secret generator.

use rand::seq::SliceRandom;
use rand::Rng;

/// Filler alphabet: ASCII letters, digits and a punctuation subset that is
/// safe inside environment variables and connection strings.
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789@#_*.;";

/// Lower bound on password length regardless of seed.
const MIN_LENGTH: usize = 10;

/// Builds seeded root passwords.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialGenerator;

impl CredentialGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generate a password containing every character of `seed`.
    ///
    /// The result has length at least `max(3, seed chars, 10)`.
    pub fn generate(&self, seed: &str) -> String {
        let mut rng = rand::rng();
        let seed_len = seed.chars().count();

        let min_filler = seed_len.max(3);
        let filler = rng
            .random_range(min_filler..=min_filler.max(MIN_LENGTH))
            .max(MIN_LENGTH.saturating_sub(seed_len));

        let mut chars: Vec<char> = seed.chars().collect();
        chars.extend(
            (0..filler).map(|_| char::from(ALPHABET[rng.random_range(0..ALPHABET.len())])),
        );
        chars.shuffle(&mut rng);
        chars.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::contains_seed;

    fn assert_contains_seed(password: &str, seed: &str) {
        assert!(
            contains_seed(password, seed),
            "password {password:?} missing characters of {seed:?}"
        );
    }

    #[test]
    fn test_length_floor_and_seed_membership() {
        let generator = CredentialGenerator::new();
        for seed in ["", "a", "al", "alice", "bob_the_builder", "aaaaaaaaaaaaaaaaaaaaaaaaa"] {
            for _ in 0..50 {
                let password = generator.generate(seed);
                let floor = 3.max(seed.chars().count()).max(10);
                assert!(password.chars().count() >= floor);
                assert_contains_seed(&password, seed);
            }
        }
    }

    #[test]
    fn test_non_ascii_seed() {
        let password = CredentialGenerator::new().generate("joão");
        assert_contains_seed(&password, "joão");
    }

    #[test]
    fn test_outputs_vary() {
        let generator = CredentialGenerator::new();
        let first = generator.generate("alice");
        let differs = (0..20).any(|_| generator.generate("alice") != first);
        assert!(differs);
    }
}
