use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

/// Newtype for password to prevent accidental logging
#[derive(Clone)]
pub struct Password(String);

impl Password {
    pub fn new(password: String) -> Self {
        Self(password)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

/// Hash a password using Argon2id with a fresh random salt.
pub fn hash_password(password: &Password) -> Result<String, anyhow::Error> {
    let salt = SaltString::generate(&mut OsRng);

    let hash = Argon2::default()
        .hash_password(password.as_str().as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
        .to_string();

    Ok(hash)
}

/// `Ok(false)` on mismatch; `Err` only when the stored hash is malformed.
pub fn verify_password(password: &Password, password_hash: &str) -> Result<bool, anyhow::Error> {
    let parsed_hash = PasswordHash::new(password_hash)
        .map_err(|e| anyhow::anyhow!("Invalid password hash format: {}", e))?;

    Ok(Argon2::default()
        .verify_password(password.as_str().as_bytes(), &parsed_hash)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_salted_argon2() {
        let password = Password::new("mySecurePassword123".to_string());
        let hash1 = hash_password(&password).unwrap();
        let hash2 = hash_password(&password).unwrap();

        assert!(hash1.starts_with("$argon2"));
        assert_ne!(hash1, hash2);
        assert!(verify_password(&password, &hash1).unwrap());
        assert!(verify_password(&password, &hash2).unwrap());
    }

    #[test]
    fn wrong_password_does_not_verify() {
        let hash = hash_password(&Password::new("mySecurePassword123".to_string())).unwrap();
        let wrong = Password::new("wrongPassword".to_string());
        assert!(!verify_password(&wrong, &hash).unwrap());
    }

    #[test]
    fn malformed_hash_is_an_error() {
        let password = Password::new("x".to_string());
        assert!(verify_password(&password, "not-a-phc-string").is_err());
    }

    #[test]
    fn debug_output_is_redacted() {
        let password = Password::new("hunter2".to_string());
        assert_eq!(format!("{:?}", password), "Password(<redacted>)");
    }
}
