//! At-rest protection for credential secrets.
//!
//! Secrets are sealed with XChaCha20-Poly1305 under a key derived from the
//! operator master key (HKDF-SHA256). The credential id is bound as associated
//! data, so a sealed blob copied onto another record will not open.
//!
//! Without a master key the sealer stores plaintext and says so loudly.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    domain::{CredentialId, SecretString},
    errors::Error,
    Result,
};

const KEY_SALT: &[u8] = b"novaxa-credential-store";
const KEY_INFO: &[u8] = b"at-rest-seal-v1";
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Persisted form of a secret, tagged by scheme.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", content = "data", rename_all = "snake_case")]
pub enum SealedSecret {
    Plaintext(String),
    /// base64(nonce || ciphertext || tag)
    Xchacha20poly1305(String),
}

impl SealedSecret {
    pub fn is_plaintext(&self) -> bool {
        matches!(self, Self::Plaintext(_))
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Plaintext(_) => "plaintext",
            Self::Xchacha20poly1305(_) => "xchacha20poly1305",
        }
    }
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedSecret({})", self.scheme())
    }
}

#[derive(Clone)]
pub struct Sealer {
    cipher: Option<XChaCha20Poly1305>,
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealer")
            .field("encrypting", &self.is_encrypting())
            .finish()
    }
}

impl Sealer {
    pub fn new(master_key: Option<&SecretString>) -> Result<Self> {
        let Some(master_key) = master_key else {
            tracing::warn!(
                "NOVAXA_MASTER_KEY is not set: credential secrets will be stored in PLAINTEXT"
            );
            return Ok(Self::plaintext());
        };

        let hk = Hkdf::<Sha256>::new(Some(KEY_SALT), master_key.expose().as_bytes());
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(KEY_INFO, &mut okm[..])
            .map_err(|e| Error::Crypto(format!("key derivation failed: {e}")))?;

        Ok(Self {
            cipher: Some(XChaCha20Poly1305::new(Key::from_slice(&okm[..]))),
        })
    }

    /// A sealer that never encrypts. Used when no master key is configured.
    pub fn plaintext() -> Self {
        Self { cipher: None }
    }

    pub fn is_encrypting(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn seal(&self, id: &CredentialId, secret: &str) -> Result<SealedSecret> {
        let Some(cipher) = &self.cipher else {
            tracing::warn!(credential = %id, "storing credential secret without encryption");
            return Ok(SealedSecret::Plaintext(secret.to_string()));
        };

        let mut nonce = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);

        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: secret.as_bytes(),
                    aad: id.as_str().as_bytes(),
                },
            )
            .map_err(|_| Error::Crypto("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(SealedSecret::Xchacha20poly1305(B64.encode(out)))
    }

    pub fn open(&self, id: &CredentialId, sealed: &SealedSecret) -> Result<SecretString> {
        let data = match sealed {
            SealedSecret::Plaintext(s) => return Ok(SecretString::new(s.clone())),
            SealedSecret::Xchacha20poly1305(data) => data,
        };

        let Some(cipher) = &self.cipher else {
            return Err(Error::Crypto(format!(
                "credential {id} is encrypted but no master key is configured"
            )));
        };

        let raw = B64
            .decode(data)
            .map_err(|e| Error::Crypto(format!("credential {id}: bad encoding: {e}")))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Crypto(format!("credential {id}: sealed value too short")));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plain = Zeroizing::new(
            cipher
                .decrypt(
                    XNonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: id.as_str().as_bytes(),
                    },
                )
                .map_err(|_| {
                    Error::Crypto(format!(
                        "credential {id}: authentication failed (wrong master key or tampered record)"
                    ))
                })?,
        );

        let text = std::str::from_utf8(&plain)
            .map_err(|_| Error::Crypto(format!("credential {id}: secret is not valid UTF-8")))?;
        Ok(SecretString::new(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(key: &str) -> Sealer {
        Sealer::new(Some(&SecretString::new(key))).unwrap()
    }

    #[test]
    fn seal_open_round_trip_hides_plaintext() {
        let sealer = keyed("master");
        let id = CredentialId::from("0011223344556677");
        let secret = "123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw";

        let sealed = sealer.seal(&id, secret).unwrap();
        let SealedSecret::Xchacha20poly1305(data) = &sealed else {
            panic!("expected encrypted secret");
        };
        assert!(!data.contains(secret));
        let raw = B64.decode(data).unwrap();
        assert!(!raw.windows(secret.len()).any(|w| w == secret.as_bytes()));

        assert_eq!(sealer.open(&id, &sealed).unwrap().expose(), secret);
    }

    #[test]
    fn sealing_twice_uses_fresh_nonces() {
        let sealer = keyed("master");
        let id = CredentialId::from("aa");
        assert_ne!(sealer.seal(&id, "x").unwrap(), sealer.seal(&id, "x").unwrap());
    }

    #[test]
    fn wrong_key_or_wrong_id_fails_to_open() {
        let id = CredentialId::from("aa");
        let sealed = keyed("right").seal(&id, "secret").unwrap();

        assert!(matches!(
            keyed("wrong").open(&id, &sealed),
            Err(Error::Crypto(_))
        ));
        assert!(matches!(
            keyed("right").open(&CredentialId::from("bb"), &sealed),
            Err(Error::Crypto(_))
        ));
        assert!(matches!(
            Sealer::plaintext().open(&id, &sealed),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn no_master_key_degrades_to_plaintext() {
        let sealer = Sealer::new(None).unwrap();
        assert!(!sealer.is_encrypting());
        let id = CredentialId::from("aa");
        let sealed = sealer.seal(&id, "tok").unwrap();
        assert_eq!(sealed, SealedSecret::Plaintext("tok".to_string()));
        assert_eq!(sealer.open(&id, &sealed).unwrap().expose(), "tok");
    }

    #[test]
    fn sealed_secret_serializes_with_scheme_tag() {
        let v = serde_json::to_value(SealedSecret::Plaintext("t".into())).unwrap();
        assert_eq!(v, serde_json::json!({"scheme": "plaintext", "data": "t"}));
    }

    #[test]
    fn unicode_secrets_round_trip() {
        let sealer = keyed("k");
        let id = CredentialId::from("cc");
        let s = "τόκεν-🔑 with spaces";
        let sealed = sealer.seal(&id, s).unwrap();
        assert_eq!(sealer.open(&id, &sealed).unwrap().expose(), s);
    }
}
