//! Secret resolution and at-rest encryption for credentials.
//!
//! The browser endpoint key is resolved from one of three sources, in order:
//! a direct value in the config file, a file (Docker secrets), or an
//! environment variable. Captured bearer tokens are encrypted with AES-256-GCM
//! before they are written to the database.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use secrecy::SecretString;
use std::fs;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: direct value, file path, or env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Resolves a secret from a direct value, a file, or an environment variable.
/// Empty strings count as "not provided". File and env values are trimmed.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    if let Some(value) = direct.filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = file_path.filter(|p| !p.is_empty()) {
        let expanded = expand_home(path);
        return fs::read_to_string(&expanded)
            .map(|content| SecretString::from(content.trim().to_string()))
            .map_err(|source| SecretError::FileRead {
                path: expanded,
                source,
            });
    }

    if let Some(var_name) = env_var.filter(|n| !n.is_empty()) {
        return match std::env::var(var_name) {
            Ok(value) => Ok(SecretString::from(value.trim().to_string())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: var_name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: var_name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

/// Like [`resolve_secret`], but a missing source is `Ok(None)`.
pub fn resolve_secret_optional(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<Option<SecretString>> {
    match resolve_secret(direct, file_path, env_var) {
        Ok(secret) => Ok(Some(secret)),
        Err(SecretError::NoSourceProvided) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Expands a leading `~` to the home directory. `~user/...` is not supported.
fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            let home = home.to_string_lossy();
            if path == "~" {
                return home.into_owned();
            }
            return path.replacen('~', &home, 1);
        }
    }
    path.to_string()
}

// ============================================
// Token Encryption
// ============================================

/// Environment variable holding the 64-hex-char token encryption key.
pub const TOKEN_KEY_ENV_VAR: &str = "PARCELSCOUT_TOKEN_KEY";

/// Nonce size for AES-256-GCM (96 bits).
const NONCE_SIZE: usize = 12;

/// AES-256-GCM encryptor for bearer tokens persisted in `bearer_tokens`.
pub struct TokenEncryptor {
    cipher: Aes256Gcm,
}

impl TokenEncryptor {
    /// Builds an encryptor from `PARCELSCOUT_TOKEN_KEY`.
    pub fn from_env() -> Result<Self> {
        let key_hex = std::env::var(TOKEN_KEY_ENV_VAR).map_err(|_| {
            SecretError::InvalidKey(format!(
                "Environment variable {} not set",
                TOKEN_KEY_ENV_VAR
            ))
        })?;
        Self::from_hex_key(key_hex.trim())
    }

    /// Builds an encryptor from a 64-character hex key (32 bytes).
    pub fn from_hex_key(key_hex: &str) -> Result<Self> {
        let key_bytes = hex_decode(key_hex)
            .map_err(|e| SecretError::InvalidKey(format!("Invalid hex key: {}", e)))?;

        if key_bytes.len() != 32 {
            return Err(SecretError::InvalidKey(format!(
                "Key must be 32 bytes (64 hex chars), got {} bytes",
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| SecretError::InvalidKey(format!("Failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }

    /// Encrypts plaintext. Output is hex of `<12-byte nonce><ciphertext>`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce_bytes)
            .map_err(|e| SecretError::Encryption(format!("Failed to generate nonce: {}", e)))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SecretError::Encryption(e.to_string()))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend(ciphertext);
        Ok(hex_encode(&combined))
    }

    pub fn decrypt(&self, ciphertext_hex: &str) -> Result<String> {
        let combined = hex_decode(ciphertext_hex)
            .map_err(|e| SecretError::Decryption(format!("Invalid hex: {}", e)))?;

        if combined.len() < NONCE_SIZE {
            return Err(SecretError::Decryption("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| SecretError::Decryption(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| SecretError::Decryption(format!("Invalid UTF-8: {}", e)))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(hex: &str) -> std::result::Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err("Hex string must have even length".to_string());
    }
    if !hex.is_ascii() {
        return Err("Hex string must be ASCII".to_string());
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| format!("Invalid hex at position {}: {}", i, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TEST_KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    #[serial]
    fn test_direct_value_wins_over_env() {
        std::env::set_var("PS_TEST_BROWSER_KEY_1", "from-env");
        let secret =
            resolve_secret(Some("from-config"), None, Some("PS_TEST_BROWSER_KEY_1")).unwrap();
        assert_eq!(secret.expose_secret(), "from-config");
        std::env::remove_var("PS_TEST_BROWSER_KEY_1");
    }

    #[test]
    #[serial]
    fn test_file_wins_over_env_and_is_trimmed() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  browserless-key  ").unwrap();

        std::env::set_var("PS_TEST_BROWSER_KEY_2", "from-env");
        let secret = resolve_secret(
            None,
            Some(file.path().to_str().unwrap()),
            Some("PS_TEST_BROWSER_KEY_2"),
        )
        .unwrap();
        assert_eq!(secret.expose_secret(), "browserless-key");
        std::env::remove_var("PS_TEST_BROWSER_KEY_2");
    }

    #[test]
    #[serial]
    fn test_empty_values_fall_through_to_env() {
        std::env::set_var("PS_TEST_BROWSER_KEY_3", "from-env");
        let secret = resolve_secret(Some(""), Some(""), Some("PS_TEST_BROWSER_KEY_3")).unwrap();
        assert_eq!(secret.expose_secret(), "from-env");
        std::env::remove_var("PS_TEST_BROWSER_KEY_3");
    }

    #[test]
    fn test_missing_sources() {
        assert!(matches!(
            resolve_secret(None, None, None),
            Err(SecretError::NoSourceProvided)
        ));
        assert!(resolve_secret_optional(None, None, None).unwrap().is_none());
        assert!(matches!(
            resolve_secret(None, Some("/nonexistent/secret"), None),
            Err(SecretError::FileRead { .. })
        ));
        assert!(matches!(
            resolve_secret(None, None, Some("PS_DEFINITELY_NOT_SET_12345")),
            Err(SecretError::EnvVarNotSet { .. })
        ));
    }

    #[test]
    fn test_expand_home_leaves_other_paths() {
        assert_eq!(expand_home("/run/secrets/key"), "/run/secrets/key");
        assert_eq!(expand_home("relative/key"), "relative/key");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_home("~/key"),
                format!("{}/key", home.to_string_lossy())
            );
        }
    }

    #[test]
    fn test_encrypt_decrypt_token() {
        let encryptor = TokenEncryptor::from_hex_key(TEST_KEY).unwrap();
        let token = "eyJhbGciOiJIUzI1NiJ9.payload.signature";

        let first = encryptor.encrypt(token).unwrap();
        let second = encryptor.encrypt(token).unwrap();
        assert_ne!(first, second, "nonce must differ per encryption");
        assert!(!first.contains("eyJ"));

        assert_eq!(encryptor.decrypt(&first).unwrap(), token);
        assert_eq!(encryptor.decrypt(&second).unwrap(), token);
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(matches!(
            TokenEncryptor::from_hex_key("0123456789abcdef"),
            Err(SecretError::InvalidKey(_))
        ));
        assert!(matches!(
            TokenEncryptor::from_hex_key("zz23456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"),
            Err(SecretError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let encryptor = TokenEncryptor::from_hex_key(TEST_KEY).unwrap();
        assert!(matches!(
            encryptor.decrypt("aabb"),
            Err(SecretError::Decryption(_))
        ));

        let ciphertext = encryptor.encrypt("token").unwrap();
        let mut bytes = hex_decode(&ciphertext).unwrap();
        if let Some(last) = bytes.last_mut() {
            *last ^= 0xff;
        }
        assert!(matches!(
            encryptor.decrypt(&hex_encode(&bytes)),
            Err(SecretError::Decryption(_))
        ));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::remove_var(TOKEN_KEY_ENV_VAR);
        assert!(TokenEncryptor::from_env().is_err());

        std::env::set_var(TOKEN_KEY_ENV_VAR, TEST_KEY);
        let encryptor = TokenEncryptor::from_env().unwrap();
        let ct = encryptor.encrypt("abc").unwrap();
        assert_eq!(encryptor.decrypt(&ct).unwrap(), "abc");
        std::env::remove_var(TOKEN_KEY_ENV_VAR);
    }
}
