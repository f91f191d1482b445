//! Root directory access passwords
//!
//! Passwords are never stored in clear: each one is kept as an argon2id PHC
//! string carrying its own salt and cost parameters.

use crate::config::SecurityConfig;
use crate::error::{Error, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::distributions::Alphanumeric;
use rand::Rng;
use zeroize::Zeroizing;

/// Hashes and verifies root passwords
#[derive(Clone)]
pub struct SecretHasher {
    argon2: Argon2<'static>,
}

impl SecretHasher {
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        let params = Params::new(
            config.argon2_memory_kib,
            config.argon2_iterations,
            config.argon2_parallelism,
            None,
        )
        .map_err(|e| Error::InvalidConfig(format!("argon2 parameters: {}", e)))?;

        Ok(SecretHasher {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hash a password into a PHC string
    pub fn hash(&self, password: &str) -> Result<String> {
        if password.is_empty() {
            return Err(Error::Password("password must not be empty".to_string()));
        }
        let salt = SaltString::generate(&mut OsRng);
        let hash = self.argon2.hash_password(password.as_bytes(), &salt)?;
        Ok(hash.to_string())
    }

    /// Check `password` against a stored PHC string
    pub fn verify(&self, password: &str, stored: &str) -> Result<bool> {
        let parsed = PasswordHash::new(stored)
            .map_err(|e| Error::Corrupted(format!("stored password hash: {}", e)))?;
        match self.argon2.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Random alphanumeric secret for password resets
pub fn generate_password(len: usize) -> Zeroizing<String> {
    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    Zeroizing::new(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn hasher() -> SecretHasher {
        SecretHasher::new(&Config::for_testing().security).unwrap()
    }

    #[test]
    fn test_hash_and_verify() {
        let hasher = hasher();
        let stored = hasher.hash("p1").unwrap();

        assert!(stored.starts_with("$argon2id$"));
        assert!(hasher.verify("p1", &stored).unwrap());
        assert!(!hasher.verify("p2", &stored).unwrap());
    }

    #[test]
    fn test_same_password_different_salt() {
        let hasher = hasher();
        assert_ne!(hasher.hash("p1").unwrap(), hasher.hash("p1").unwrap());
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(matches!(hasher().hash(""), Err(Error::Password(_))));
    }

    #[test]
    fn test_garbage_hash_is_corruption() {
        assert!(matches!(
            hasher().verify("p1", "not-a-phc-string"),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_generate_password() {
        let secret = generate_password(20);
        assert_eq!(secret.len(), 20);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
