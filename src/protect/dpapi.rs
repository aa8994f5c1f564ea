//! Windows Data Protection API in the local-machine scope.
//!
//! The key is held by the LSA and never leaves the machine, so a token copied
//! elsewhere cannot be opened even by someone who knows every machine
//! identifier. Token format: base64 of the DPAPI blob.

use super::{ProtectionError, SecretProtector};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::debug;
use windows::core::w;
use windows::Win32::Foundation::{LocalFree, HLOCAL};
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_LOCAL_MACHINE, CRYPTPROTECT_UI_FORBIDDEN,
    CRYPT_INTEGER_BLOB,
};
use zeroize::{Zeroize, Zeroizing};

/// [`SecretProtector`] backed by `CryptProtectData`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DpapiProtector;

impl DpapiProtector {
    pub fn new() -> Self {
        Self
    }
}

impl SecretProtector for DpapiProtector {
    fn protect(&self, plaintext: &str) -> Result<String, ProtectionError> {
        let mut input = Zeroizing::new(plaintext.as_bytes().to_vec());
        let data_in = blob(&mut input)?;
        let mut data_out = CRYPT_INTEGER_BLOB::default();

        unsafe {
            CryptProtectData(
                &data_in,
                w!("workstation-setup"),
                None,
                None,
                None,
                CRYPTPROTECT_LOCAL_MACHINE | CRYPTPROTECT_UI_FORBIDDEN,
                &mut data_out,
            )
        }
        .map_err(|e| ProtectionError::Platform(format!("CryptProtectData: {}", e)))?;

        let protected = take_output(&mut data_out);
        Ok(BASE64.encode(protected))
    }

    fn unprotect(&self, token: &str) -> Result<Zeroizing<String>, ProtectionError> {
        let mut raw = BASE64.decode(token.trim())?;
        if raw.is_empty() {
            return Err(ProtectionError::Malformed("token is empty"));
        }
        let data_in = blob(&mut raw)?;
        let mut data_out = CRYPT_INTEGER_BLOB::default();

        // Tokens from another machine and altered tokens fail here alike.
        unsafe {
            CryptUnprotectData(
                &data_in,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_UI_FORBIDDEN,
                &mut data_out,
            )
        }
        .map_err(|e| {
            debug!("CryptUnprotectData failed: {}", e);
            ProtectionError::IntegrityCheck
        })?;

        let plaintext = take_output(&mut data_out);
        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|e| {
                let mut bytes = e.into_bytes();
                bytes.zeroize();
                ProtectionError::Malformed("plaintext is not UTF-8")
            })
    }
}

fn blob(data: &mut [u8]) -> Result<CRYPT_INTEGER_BLOB, ProtectionError> {
    let len = u32::try_from(data.len()).map_err(|_| ProtectionError::Malformed("input too large"))?;
    Ok(CRYPT_INTEGER_BLOB {
        cbData: len,
        pbData: data.as_mut_ptr(),
    })
}

/// Copy a DPAPI output blob into owned memory, wipe it and release it.
fn take_output(out: &mut CRYPT_INTEGER_BLOB) -> Vec<u8> {
    if out.pbData.is_null() {
        return Vec::new();
    }
    // SAFETY: on success DPAPI hands back `cbData` bytes allocated with LocalAlloc.
    let bytes = unsafe { std::slice::from_raw_parts_mut(out.pbData, out.cbData as usize) };
    let owned = bytes.to_vec();
    bytes.zeroize();
    unsafe {
        let _ = LocalFree(HLOCAL(out.pbData as _));
    }
    out.pbData = std::ptr::null_mut();
    out.cbData = 0;
    owned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_on_this_machine() {
        let p = DpapiProtector::new();
        let token = p.protect("P@ssw0rd! ünïcødé").unwrap();
        assert!(!token.contains("P@ssw0rd"));
        assert_eq!(p.unprotect(&token).unwrap().as_str(), "P@ssw0rd! ünïcødé");
    }

    #[test]
    fn test_altered_or_foreign_tokens_fail() {
        let p = DpapiProtector::new();
        let mut raw = BASE64.decode(p.protect("secret").unwrap()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(matches!(
            p.unprotect(&BASE64.encode(raw)),
            Err(ProtectionError::IntegrityCheck)
        ));
        assert!(matches!(
            p.unprotect(&BASE64.encode(b"not a dpapi blob")),
            Err(ProtectionError::IntegrityCheck)
        ));
        assert!(matches!(p.unprotect(""), Err(ProtectionError::Malformed(_))));
        assert!(matches!(p.unprotect("%%"), Err(ProtectionError::Encoding(_))));
    }
}
