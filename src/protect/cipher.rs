//! Token format: base64(`version || nonce || ciphertext+tag`).

use super::{MachineKey, ProtectionError, SecretProtector};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

const TOKEN_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const AAD: &[u8] = b"workstation-setup";

type HmacSha256 = Hmac<Sha256>;

/// [`SecretProtector`] keyed by a [`MachineKey`].
pub struct MachineProtector {
    cipher_key: [u8; 32],
    nonce_key: [u8; 32],
}

impl MachineProtector {
    /// Split the machine key into an encryption subkey and a nonce subkey.
    pub fn new(key: &MachineKey) -> Result<Self, ProtectionError> {
        let hk = Hkdf::<Sha256>::from_prk(key.as_bytes())
            .map_err(|e| ProtectionError::KeyUnavailable(e.to_string()))?;
        let mut cipher_key = [0u8; 32];
        let mut nonce_key = [0u8; 32];
        hk.expand(b"secret-protector/cipher", &mut cipher_key)
            .map_err(|e| ProtectionError::KeyUnavailable(e.to_string()))?;
        hk.expand(b"secret-protector/nonce", &mut nonce_key)
            .map_err(|e| ProtectionError::KeyUnavailable(e.to_string()))?;
        Ok(Self {
            cipher_key,
            nonce_key,
        })
    }

    /// Protector keyed by the local machine id.
    #[cfg(not(windows))]
    pub fn for_this_machine() -> Result<Self, ProtectionError> {
        Self::new(&MachineKey::discover()?)
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, ProtectionError> {
        ChaCha20Poly1305::new_from_slice(&self.cipher_key).map_err(|_| ProtectionError::Encryption)
    }

    fn synthetic_nonce(&self, plaintext: &[u8]) -> Result<[u8; NONCE_LEN], ProtectionError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.nonce_key)
            .map_err(|_| ProtectionError::Encryption)?;
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        Ok(nonce)
    }
}

impl SecretProtector for MachineProtector {
    fn protect(&self, plaintext: &str) -> Result<String, ProtectionError> {
        let nonce_bytes = self.synthetic_nonce(plaintext.as_bytes())?;
        let ciphertext = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: AAD,
                },
            )
            .map_err(|_| ProtectionError::Encryption)?;

        let mut token = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(token))
    }

    fn unprotect(&self, token: &str) -> Result<Zeroizing<String>, ProtectionError> {
        let raw = BASE64.decode(token.trim())?;
        if raw.len() < 1 + NONCE_LEN + TAG_LEN {
            return Err(ProtectionError::Malformed("token too short"));
        }
        if raw[0] != TOKEN_VERSION {
            return Err(ProtectionError::Malformed("unknown token version"));
        }

        let (nonce_bytes, ciphertext) = raw[1..].split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: AAD,
                },
            )
            .map_err(|_| ProtectionError::IntegrityCheck)?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|e| {
                let mut bytes = e.into_bytes();
                bytes.zeroize();
                ProtectionError::Malformed("plaintext is not UTF-8")
            })
    }
}

impl Drop for MachineProtector {
    fn drop(&mut self) {
        self.cipher_key.zeroize();
        self.nonce_key.zeroize();
    }
}

impl std::fmt::Debug for MachineProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineProtector").finish_non_exhaustive()
    }
}
