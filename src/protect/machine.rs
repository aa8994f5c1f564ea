use super::ProtectionError;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

const HKDF_SALT: &[u8] = b"workstation-setup-machine-key-v1";
const HKDF_INFO: &[u8] = b"machine-key";

/// Key material bound to the local machine.
pub struct MachineKey {
    bytes: [u8; 32],
}

impl MachineKey {
    /// Derive a key from arbitrary identity material.
    pub fn from_material(material: &[u8]) -> Result<Self, ProtectionError> {
        if material.is_empty() {
            return Err(ProtectionError::KeyUnavailable(
                "machine identity is empty".to_string(),
            ));
        }
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), material);
        let mut bytes = [0u8; 32];
        hk.expand(HKDF_INFO, &mut bytes)
            .map_err(|e| ProtectionError::KeyUnavailable(e.to_string()))?;
        Ok(Self { bytes })
    }

    /// Derive the key from the machine's systemd/D-Bus machine id.
    #[cfg(not(windows))]
    pub fn discover() -> Result<Self, ProtectionError> {
        let identity = machine_identity()?;
        Self::from_material(identity.trim().as_bytes())
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl Drop for MachineKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MachineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineKey").finish_non_exhaustive()
    }
}

#[cfg(not(windows))]
fn machine_identity() -> Result<String, ProtectionError> {
    const SOURCES: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];
    for source in SOURCES {
        if let Ok(contents) = std::fs::read_to_string(source) {
            if !contents.trim().is_empty() {
                return Ok(contents);
            }
        }
    }
    Err(ProtectionError::KeyUnavailable(format!(
        "none of {} is readable",
        SOURCES.join(", ")
    )))
}
