//! Password policy: hashing, verification, strength rules, and secure
//! random material (reset tokens, temporary passwords).
//!
//! New hashes are argon2id PHC strings. The legacy format
//! `sha256$<iterations>$<salt>$<hex>` (iterated SHA-256 with a per-user
//! salt) is still accepted by [`PasswordPolicy::verify`] so accounts created
//! before the argon2 migration can log in and be rehashed.

use crate::config::PasswordConfig;
use crate::error::{IdentityError, IdentityResult};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;

/// Minimum password length, in characters.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Length of generated temporary passwords.
pub const TEMP_PASSWORD_LENGTH: usize = 12;

/// Token byte length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

/// Punctuation accepted as the "symbol" character class.
pub const SYMBOLS: &str = "!@#$%^&*()-_=+[]{};:,.<>?/~";

const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";

const LEGACY_PREFIX: &str = "sha256";

/// Upper bound on legacy iteration counts, so a corrupted record cannot
/// pin a CPU.
const LEGACY_MAX_ITERATIONS: u32 = 1_000_000;

/// A single failed strength rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordViolation {
    TooShort,
    MissingUppercase,
    MissingLowercase,
    MissingDigit,
    MissingSymbol,
}

impl fmt::Display for PasswordViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(
                f,
                "Password must be at least {MIN_PASSWORD_LENGTH} characters long"
            ),
            Self::MissingUppercase => {
                write!(f, "Password must contain at least one uppercase letter")
            }
            Self::MissingLowercase => {
                write!(f, "Password must contain at least one lowercase letter")
            }
            Self::MissingDigit => write!(f, "Password must contain at least one digit"),
            Self::MissingSymbol => write!(
                f,
                "Password must contain at least one special character ({SYMBOLS})"
            ),
        }
    }
}

/// Outcome of [`validate_strength`]. Every violated rule is listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrengthReport {
    pub violations: Vec<PasswordViolation>,
}

impl StrengthReport {
    pub fn is_strong(&self) -> bool {
        self.violations.is_empty()
    }

    /// All violations joined into one user-facing sentence list.
    pub fn message(&self) -> String {
        self.violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Check a candidate password against all strength rules.
pub fn validate_strength(password: &str) -> StrengthReport {
    let mut violations = Vec::new();

    if password.chars().count() < MIN_PASSWORD_LENGTH {
        violations.push(PasswordViolation::TooShort);
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        violations.push(PasswordViolation::MissingUppercase);
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        violations.push(PasswordViolation::MissingLowercase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        violations.push(PasswordViolation::MissingDigit);
    }
    if !password.chars().any(|c| SYMBOLS.contains(c)) {
        violations.push(PasswordViolation::MissingSymbol);
    }

    StrengthReport { violations }
}

/// Generate a random opaque token (32 bytes, hex-encoded).
///
/// Used for both session tokens and password-reset tokens.
pub fn generate_token() -> IdentityResult<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
        tracing::error!("OS random source failed while generating a token: {e}");
        IdentityError::security("random source unavailable")
    })?;
    Ok(hex::encode(bytes))
}

/// Alias kept for call sites that read better with the reset vocabulary.
pub fn generate_reset_token() -> IdentityResult<String> {
    generate_token()
}

/// Generate a 12-character password that always satisfies
/// [`validate_strength`].
pub fn generate_temporary_password() -> String {
    let mut rng = OsRng;
    let classes: [&[u8]; 4] = [UPPERCASE, LOWERCASE, DIGITS, SYMBOLS.as_bytes()];
    let alphabet = classes.concat();

    let mut chars: Vec<u8> = Vec::with_capacity(TEMP_PASSWORD_LENGTH);
    for class in classes {
        chars.push(class[rng.gen_range(0..class.len())]);
    }
    while chars.len() < TEMP_PASSWORD_LENGTH {
        chars.push(alphabet[rng.gen_range(0..alphabet.len())]);
    }
    chars.shuffle(&mut rng);

    chars.into_iter().map(char::from).collect()
}

/// Slow, salted password hashing with argon2id.
#[derive(Clone)]
pub struct PasswordPolicy {
    params: Params,
}

impl fmt::Debug for PasswordPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordPolicy")
            .field("memory_kib", &self.params.m_cost())
            .field("iterations", &self.params.t_cost())
            .field("parallelism", &self.params.p_cost())
            .finish()
    }
}

impl PasswordPolicy {
    pub fn new(config: &PasswordConfig) -> IdentityResult<Self> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|e| {
                tracing::error!("Rejected argon2 parameters: {e}");
                IdentityError::security(format!("invalid argon2 parameters: {e}"))
            })?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash a plaintext password with a fresh random salt.
    pub fn hash(&self, plaintext: &str) -> IdentityResult<String> {
        if plaintext.is_empty() {
            return Err(IdentityError::security("cannot hash an empty password"));
        }
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| {
                tracing::error!("Password hashing failed: {e}");
                IdentityError::security("password hashing failed")
            })
    }

    /// Check a plaintext password against a stored hash.
    ///
    /// Only empty input is an error. Any mismatch, unknown format, or
    /// malformed hash yields `Ok(false)`.
    pub fn verify(&self, plaintext: &str, stored_hash: &str) -> IdentityResult<bool> {
        if plaintext.is_empty() || stored_hash.is_empty() {
            return Err(IdentityError::security(
                "cannot verify an empty password or hash",
            ));
        }

        if stored_hash.starts_with("$argon2") {
            let Ok(parsed) = PasswordHash::new(stored_hash) else {
                return Ok(false);
            };
            // Cost parameters come from the PHC string itself.
            return Ok(Argon2::default()
                .verify_password(plaintext.as_bytes(), &parsed)
                .is_ok());
        }

        if stored_hash.starts_with(LEGACY_PREFIX) {
            return Ok(verify_legacy(plaintext, stored_hash));
        }

        Ok(false)
    }

    /// Whether a stored hash should be replaced on the next successful login.
    pub fn needs_rehash(&self, stored_hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(stored_hash) else {
            return true;
        };
        if parsed.algorithm != Algorithm::Argon2id.ident() {
            return true;
        }
        match Params::try_from(&parsed) {
            Ok(params) => {
                params.m_cost() != self.params.m_cost()
                    || params.t_cost() != self.params.t_cost()
                    || params.p_cost() != self.params.p_cost()
            }
            Err(_) => true,
        }
    }

    /// Burn roughly one verification worth of CPU. Called when a login
    /// identifier matched no user so the response time does not reveal it.
    pub fn dummy_verify(&self, plaintext: &str) {
        let salt = SaltString::generate(&mut OsRng);
        let _ = self.argon2().hash_password(plaintext.as_bytes(), &salt);
    }
}

// ── Legacy iterated SHA-256 ─────────────────────────────────────────

/// Produce a legacy-format hash. Only used to seed migration fixtures.
pub fn hash_legacy(password: &str, salt: &str, iterations: u32) -> String {
    format!(
        "{LEGACY_PREFIX}${iterations}${salt}${}",
        legacy_digest(password, salt, iterations)
    )
}

fn verify_legacy(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(4, '$');
    let (Some(LEGACY_PREFIX), Some(iterations), Some(salt), Some(expected)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    if iterations == 0 || iterations > LEGACY_MAX_ITERATIONS || salt.is_empty() {
        return false;
    }
    let attempt = legacy_digest(password, salt, iterations);
    constant_time_eq(attempt.as_bytes(), expected.as_bytes())
}

fn legacy_digest(password: &str, salt: &str, iterations: u32) -> String {
    let mut hash = Sha256::new();
    hash.update(salt.as_bytes());
    hash.update(password.as_bytes());
    let mut result = hash.finalize();

    for _ in 1..iterations {
        let mut h = Sha256::new();
        h.update(result);
        h.update(salt.as_bytes());
        result = h.finalize();
    }

    hex::encode(result)
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn policy() -> PasswordPolicy {
        PasswordPolicy::new(&PasswordConfig::fast_insecure()).unwrap()
    }

    #[test]
    fn hash_then_verify() {
        let policy = policy();
        let hash = policy.hash("Str0ng!Pw").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(policy.verify("Str0ng!Pw", &hash).unwrap());
        assert!(!policy.verify("Str0ng!Px", &hash).unwrap());
    }

    #[test]
    fn hash_is_salted() {
        let policy = policy();
        let h1 = policy.hash("Str0ng!Pw").unwrap();
        let h2 = policy.hash("Str0ng!Pw").unwrap();
        assert_ne!(h1, h2);
        assert!(policy.verify("Str0ng!Pw", &h1).unwrap());
        assert!(policy.verify("Str0ng!Pw", &h2).unwrap());
    }

    #[test]
    fn empty_input_is_security_error() {
        let policy = policy();
        assert!(matches!(policy.hash(""), Err(IdentityError::Security(_))));
        assert!(matches!(
            policy.verify("", "$argon2id$whatever"),
            Err(IdentityError::Security(_))
        ));
        assert!(matches!(
            policy.verify("Str0ng!Pw", ""),
            Err(IdentityError::Security(_))
        ));
    }

    #[test]
    fn malformed_hashes_verify_false() {
        let policy = policy();
        assert!(!policy.verify("Str0ng!Pw", "$argon2id$garbage").unwrap());
        assert!(!policy.verify("Str0ng!Pw", "plaintext-from-2009").unwrap());
        assert!(!policy.verify("Str0ng!Pw", "sha256$abc$salt$00").unwrap());
        assert!(!policy.verify("Str0ng!Pw", "sha256$0$salt$00").unwrap());
        assert!(!policy.verify("Str0ng!Pw", "sha256$10").unwrap());
    }

    #[test]
    fn legacy_hash_verifies() {
        let policy = policy();
        let legacy = hash_legacy("OldPass1!", "a1b2c3d4", 1000);
        assert!(policy.verify("OldPass1!", &legacy).unwrap());
        assert!(!policy.verify("OldPass1?", &legacy).unwrap());
        assert!(policy.needs_rehash(&legacy));
    }

    #[test]
    fn fresh_hash_does_not_need_rehash() {
        let policy = policy();
        let hash = policy.hash("Str0ng!Pw").unwrap();
        assert!(!policy.needs_rehash(&hash));

        let stronger = PasswordPolicy::new(&PasswordConfig {
            memory_kib: 2048,
            iterations: 2,
            parallelism: 1,
        })
        .unwrap();
        assert!(stronger.needs_rehash(&hash));
    }

    #[test]
    fn invalid_params_rejected() {
        let result = PasswordPolicy::new(&PasswordConfig {
            memory_kib: 1,
            iterations: 0,
            parallelism: 0,
        });
        assert!(matches!(result, Err(IdentityError::Security(_))));
    }

    #[test]
    fn strong_password_has_no_violations() {
        let report = validate_strength("Str0ng!Pw");
        assert!(report.is_strong());
        assert!(report.violations.is_empty());
        assert!(report.message().is_empty());
    }

    #[test]
    fn each_rule_reported() {
        let cases = [
            ("Sh0rt!", PasswordViolation::TooShort),
            ("lowercase1!", PasswordViolation::MissingUppercase),
            ("UPPERCASE1!", PasswordViolation::MissingLowercase),
            ("NoDigitsHere!", PasswordViolation::MissingDigit),
            ("NoSymbols123", PasswordViolation::MissingSymbol),
        ];
        for (password, expected) in cases {
            let report = validate_strength(password);
            assert!(!report.is_strong(), "{password} should be weak");
            assert_eq!(report.violations, vec![expected], "{password}");
        }
    }

    #[test]
    fn all_violations_reported_together() {
        let report = validate_strength("");
        assert_eq!(report.violations.len(), 5);
        let message = report.message();
        assert!(message.contains("at least 8"));
        assert!(message.contains("uppercase"));
        assert!(message.contains("special character"));
    }

    #[test]
    fn tokens_are_64_hex_chars_and_unique() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let token = generate_reset_token().unwrap();
            assert_eq!(token.len(), 64);
            assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(token));
        }
    }

    #[test]
    fn temporary_passwords_are_strong_and_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let password = generate_temporary_password();
            assert_eq!(password.chars().count(), TEMP_PASSWORD_LENGTH);
            assert!(validate_strength(&password).is_strong(), "{password}");
            assert!(seen.insert(password));
        }
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }

    #[test]
    fn debug_does_not_panic() {
        let rendered = format!("{:?}", policy());
        assert!(rendered.contains("memory_kib"));
    }
}
