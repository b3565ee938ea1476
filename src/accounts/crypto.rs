use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64_ENGINE, Engine};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const ARGON2_M_COST: u32 = 19_456;
const ARGON2_T_COST: u32 = 2;
const ARGON2_P_COST: u32 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption error")]
    Encryption,
    #[error("decryption error")]
    Decryption,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Base64 envelope stored in `sender_accounts.encrypted_config`. Each
/// account gets its own salt, so two accounts with identical credentials
/// produce unrelated ciphertexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedConfig {
    salt: String,
    nonce: String,
    ciphertext: String,
}

pub fn seal_config<T: Serialize>(master_key: &[u8], config: &T) -> Result<String, CryptoError> {
    let plaintext = Zeroizing::new(serde_json::to_vec(config)?);

    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let derived_key = derive_key(master_key, &salt)?;
    let cipher = Aes256Gcm::new(GenericArray::from_slice(derived_key.as_ref()));

    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| CryptoError::Encryption)?;

    let sealed = SealedConfig {
        salt: BASE64_ENGINE.encode(salt),
        nonce: BASE64_ENGINE.encode(nonce),
        ciphertext: BASE64_ENGINE.encode(ciphertext),
    };

    Ok(serde_json::to_string(&sealed)?)
}

pub fn open_config<T: for<'de> Deserialize<'de>>(
    master_key: &[u8],
    sealed: &str,
) -> Result<T, CryptoError> {
    let envelope: SealedConfig = serde_json::from_str(sealed)?;

    let salt = BASE64_ENGINE
        .decode(envelope.salt.as_bytes())
        .map_err(|_| CryptoError::Decryption)?;
    let nonce = BASE64_ENGINE
        .decode(envelope.nonce.as_bytes())
        .map_err(|_| CryptoError::Decryption)?;
    let ciphertext = BASE64_ENGINE
        .decode(envelope.ciphertext.as_bytes())
        .map_err(|_| CryptoError::Decryption)?;

    let derived_key = derive_key(master_key, &salt)?;
    let cipher = Aes256Gcm::new(GenericArray::from_slice(derived_key.as_ref()));

    let plaintext = Zeroizing::new(
        cipher
            .decrypt(GenericArray::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| CryptoError::Decryption)?,
    );

    Ok(serde_json::from_slice(&plaintext)?)
}

fn derive_key(secret: &[u8], salt: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let params = Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, Some(32))
        .map_err(|_| CryptoError::Encryption)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = Zeroizing::new(vec![0u8; 32]);
    argon2
        .hash_password_into(secret, salt, output.as_mut())
        .map_err(|_| CryptoError::Encryption)?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderConfig;

    fn sample_config() -> ProviderConfig {
        ProviderConfig {
            host: Some("smtp.example.com".into()),
            port: Some(587),
            username: "mailer@example.com".into(),
            password: "app-password".into(),
            from_address: "mailer@example.com".into(),
            from_name: Some("Mailer".into()),
            use_tls: false,
            use_starttls: true,
        }
    }

    #[test]
    fn seal_and_open_roundtrip() {
        let key = b"an-engine-wide-master-secret";
        let sealed = seal_config(key, &sample_config()).unwrap();
        let opened: ProviderConfig = open_config(key, &sealed).unwrap();
        assert_eq!(opened.username, "mailer@example.com");
        assert_eq!(opened.port, Some(587));
    }

    #[test]
    fn sealed_blob_hides_plaintext() {
        let sealed = seal_config(b"key", &sample_config()).unwrap();
        assert!(!sealed.contains("app-password"));
        assert!(!sealed.contains("mailer@example.com"));
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = seal_config(b"right-key", &sample_config()).unwrap();
        let result: Result<ProviderConfig, _> = open_config(b"wrong-key", &sealed);
        assert!(matches!(result, Err(CryptoError::Decryption)));
    }

    #[test]
    fn distinct_seals_of_same_config_differ() {
        let key = b"key";
        let a = seal_config(key, &sample_config()).unwrap();
        let b = seal_config(key, &sample_config()).unwrap();
        assert_ne!(a, b);
    }
}
