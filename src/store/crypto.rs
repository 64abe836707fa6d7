//! XOR obfuscation keyed to machine identity.
//!
//! This is explicitly **not** authenticated encryption: it provides no confidentiality
//! against a local attacker who can read the same machine-identity sources. It exists
//! to keep plain-text facts and preferences out of casual `sqlite3 agency.sqlite3`
//! inspection, not to defend against a motivated adversary with local access.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Derive a stable key from machine identity sources (hostname plus, on Linux,
/// `/etc/machine-id`). Falls back to a fixed string if neither is available, which
/// is logged but not fatal — obfuscation degrades gracefully, it never blocks startup.
pub fn derive_machine_key() -> Result<[u8; 32], StoreError> {
    let mut material = String::new();
    if let Ok(hostname) = std::env::var("HOSTNAME").or_else(|_| std::env::var("COMPUTERNAME")) {
        material.push_str(&hostname);
    }
    if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
        material.push_str(id.trim());
    }
    if material.is_empty() {
        material.push_str("local-agency-fallback-key");
    }
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    Ok(key)
}

fn xor_with_key(data: &[u8], key: &[u8; 32]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

/// Obfuscate a UTF-8 string: XOR against the machine key, then base64-encode.
pub fn obfuscate(plaintext: &str, key: &[u8; 32]) -> String {
    let xored = xor_with_key(plaintext.as_bytes(), key);
    STANDARD.encode(xored)
}

/// Reverse [`obfuscate`]. Errors if the base64 or resulting bytes are not valid UTF-8.
pub fn deobfuscate(encoded: &str, key: &[u8; 32]) -> Result<String, StoreError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::KeyDerivation(e.to_string()))?;
    let xored = xor_with_key(&bytes, key);
    String::from_utf8(xored).map_err(|e| StoreError::KeyDerivation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_ascii() {
        let key = derive_machine_key().unwrap();
        let plaintext = "the quick brown fox";
        let enc = obfuscate(plaintext, &key);
        assert_ne!(enc, plaintext);
        assert_eq!(deobfuscate(&enc, &key).unwrap(), plaintext);
    }

    #[test]
    fn round_trip_multibyte() {
        let key = derive_machine_key().unwrap();
        let plaintext = "héllo wörld — 日本語 🎉";
        let enc = obfuscate(plaintext, &key);
        assert_eq!(deobfuscate(&enc, &key).unwrap(), plaintext);
    }

    #[test]
    fn round_trip_empty() {
        let key = derive_machine_key().unwrap();
        let enc = obfuscate("", &key);
        assert_eq!(deobfuscate(&enc, &key).unwrap(), "");
    }
}
