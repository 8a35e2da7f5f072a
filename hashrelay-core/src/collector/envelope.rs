//! Hybrid encryption of report payloads.
//!
//! The batch is encrypted with a fresh AES-256-CBC key (PKCS#7 padding), and
//! that key is encrypted to the collector's RSA public key with PKCS#1 v1.5.
//! The collector decrypts with its private key; there is no negotiation.

use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// Public key of the collector, compiled in.
pub const COLLECTOR_PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAqCunhYywQXAbKa81dSXb
c6ehLHSwhQWm69cXwVJ90p9Orbg7raHQSwbn2VjU1jszc2JVQIvhRevPntOGcV+9
pZxEzAurxiS/QFWSgKHvf8dzRuej8qOvaNTw5qgQKqkxlQ0DCCM0uSlOvpvOiezC
Rp+bSoXn86/PDdEAiSV8YBdgqyODlOMudvv1pV7Zb2a1Elh557iL7BCHHfzsLqtf
OLPk4Suguny+EZ/o4z7ReagiPJZt59QY427yxeOrKekJt4xYnNsPuwJw+EmIVYH0
M1HTCa3GRw9mxvu84rTYK31NnUlH5vsvyhnIMRYKtInJgQ4x95whFmjaSmfN9qJY
qQIDAQAB
-----END PUBLIC KEY-----";

/// Body of `POST /report`. All fields are standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub encrypted_key: String,
    pub iv: String,
    pub encrypted_data: String,
}

/// One-shot, stateless envelope builder.
///
/// A key that fails to load is kept as an error so that it fails each
/// send attempt instead of the whole process.
pub struct PayloadEncryptor {
    public_key: std::result::Result<RsaPublicKey, String>,
}

impl PayloadEncryptor {
    pub fn new(public_key: RsaPublicKey) -> Self {
        Self {
            public_key: Ok(public_key),
        }
    }

    /// Encryptor for a SPKI PEM public key
    pub fn from_pem(pem: &str) -> Self {
        let public_key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| format!("invalid collector public key: {}", e));
        if let Err(e) = &public_key {
            tracing::error!(error = %e, "Collector public key failed to load");
        }
        Self { public_key }
    }

    /// Encryptor for the compiled-in collector key
    pub fn embedded() -> Self {
        Self::from_pem(COLLECTOR_PUBLIC_KEY_PEM)
    }

    pub fn has_valid_key(&self) -> bool {
        self.public_key.is_ok()
    }

    /// Encrypt `plaintext` under a freshly generated key and IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope> {
        let public_key = self
            .public_key
            .as_ref()
            .map_err(|e| Error::Crypto(e.clone()))?;

        let mut rng = OsRng;
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);

        let encrypted_data = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|e| Error::Crypto(format!("invalid AES key/IV length: {}", e)))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let encrypted_key = public_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, &key)
            .map_err(|e| Error::Crypto(format!("RSA key wrap failed: {}", e)))?;

        Ok(Envelope {
            encrypted_key: STANDARD.encode(encrypted_key),
            iv: STANDARD.encode(iv),
            encrypted_data: STANDARD.encode(encrypted_data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockDecryptMut;
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPrivateKey;
    use std::sync::OnceLock;

    type Aes256CbcDec = cbc::Decryptor<Aes256>;

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1024).unwrap())
    }

    /// What the collector does on receipt
    fn open(private_key: &RsaPrivateKey, envelope: &Envelope) -> Vec<u8> {
        let key = private_key
            .decrypt(
                Pkcs1v15Encrypt,
                &STANDARD.decode(&envelope.encrypted_key).unwrap(),
            )
            .unwrap();
        let iv = STANDARD.decode(&envelope.iv).unwrap();
        let data = STANDARD.decode(&envelope.encrypted_data).unwrap();

        Aes256CbcDec::new_from_slices(&key, &iv)
            .unwrap()
            .decrypt_padded_vec_mut::<Pkcs7>(&data)
            .unwrap()
    }

    #[test]
    fn test_round_trip_reproduces_plaintext() {
        let private_key = test_key();
        let encryptor = PayloadEncryptor::new(RsaPublicKey::from(private_key));

        let plaintext = br#"[{"hash":"abc123","type":"sha256","malware_name":"Trojan.X","rule_match":"RULE_1"}]"#;
        let envelope = encryptor.encrypt(plaintext).unwrap();

        assert_eq!(open(private_key, &envelope), plaintext.to_vec());
    }

    #[test]
    fn test_ciphertext_is_block_padded() {
        let encryptor = PayloadEncryptor::new(RsaPublicKey::from(test_key()));

        // A full block of input still gains a full block of padding
        let envelope = encryptor.encrypt(&[b'x'; 16]).unwrap();
        let data = STANDARD.decode(&envelope.encrypted_data).unwrap();
        assert_eq!(data.len(), 32);
        assert_eq!(STANDARD.decode(&envelope.iv).unwrap().len(), IV_LEN);
    }

    #[test]
    fn test_fresh_key_and_iv_per_call() {
        let encryptor = PayloadEncryptor::new(RsaPublicKey::from(test_key()));

        let a = encryptor.encrypt(b"same payload").unwrap();
        let b = encryptor.encrypt(b"same payload").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.encrypted_key, b.encrypted_key);
        assert_ne!(a.encrypted_data, b.encrypted_data);
    }

    #[test]
    fn test_embedded_key_loads() {
        let encryptor = PayloadEncryptor::embedded();
        assert!(encryptor.has_valid_key());

        let key = RsaPublicKey::from_public_key_pem(COLLECTOR_PUBLIC_KEY_PEM).unwrap();
        assert_eq!(key.size(), 256);

        let envelope = encryptor.encrypt(b"[]").unwrap();
        let wrapped = STANDARD.decode(&envelope.encrypted_key).unwrap();
        assert_eq!(wrapped.len(), 256);
    }

    #[test]
    fn test_malformed_key_fails_each_call() {
        let encryptor = PayloadEncryptor::from_pem("-----BEGIN PUBLIC KEY-----\nnope\n");
        assert!(!encryptor.has_valid_key());

        let err = encryptor.encrypt(b"[]").unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
        assert!(encryptor.encrypt(b"[]").is_err());
    }

    #[test]
    fn test_envelope_wire_names() {
        let envelope = Envelope {
            encrypted_key: "a".to_string(),
            iv: "b".to_string(),
            encrypted_data: "c".to_string(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"encrypted_key": "a", "iv": "b", "encrypted_data": "c"})
        );
    }
}
