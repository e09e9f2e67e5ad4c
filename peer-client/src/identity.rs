//! Local identity store
//!
//! A JSON file holding the display name, the preferred control port and an
//! Ed25519 keypair. Created on first use and read back unchanged afterwards.

use std::fmt;
use std::fs;
use std::path::Path;

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum IdentityError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    KeyGeneration,
    /// Stored key material does not form a valid keypair
    InvalidKey,
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Io(e) => write!(f, "identity file error: {}", e),
            IdentityError::Parse(e) => write!(f, "invalid identity file: {}", e),
            IdentityError::KeyGeneration => write!(f, "failed to generate keypair"),
            IdentityError::InvalidKey => write!(f, "stored keypair is invalid"),
        }
    }
}

impl std::error::Error for IdentityError {}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    /// Local port for the control connection; 0 picks an ephemeral port
    pub default_port: u16,
    public_key: Vec<u8>,
    pkcs8: Vec<u8>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("default_port", &self.default_port)
            .field("public_key_len", &self.public_key.len())
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Fresh identity with a new keypair
    pub fn generate(name: impl Into<String>, default_port: u16) -> Result<Self, IdentityError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| IdentityError::KeyGeneration)?;
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| IdentityError::InvalidKey)?;

        Ok(Self {
            name: name.into(),
            default_port,
            public_key: pair.public_key().as_ref().to_vec(),
            pkcs8: pkcs8.as_ref().to_vec(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let text = fs::read_to_string(path).map_err(IdentityError::Io)?;
        let identity: Identity = serde_json::from_str(&text).map_err(IdentityError::Parse)?;

        let pair = Ed25519KeyPair::from_pkcs8(&identity.pkcs8).map_err(|_| IdentityError::InvalidKey)?;
        if pair.public_key().as_ref() != identity.public_key.as_slice() {
            return Err(IdentityError::InvalidKey);
        }

        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(IdentityError::Io)?;
        }
        let text = serde_json::to_string_pretty(self).map_err(IdentityError::Parse)?;
        fs::write(path, text).map_err(IdentityError::Io)
    }

    /// Read the identity at `path`, creating it with `name` if missing
    pub fn load_or_create(path: &Path, name: &str) -> Result<Self, IdentityError> {
        if path.exists() {
            return Self::load(path);
        }

        let identity = Self::generate(name, 0)?;
        identity.save(path)?;
        log::info!("Created identity '{}' at {}", name, path.display());
        Ok(identity)
    }

    /// `(public, private)`; the private half is the PKCS#8 document
    pub fn get_keypair(&self) -> (&[u8], &[u8]) {
        (&self.public_key, &self.pkcs8)
    }

    pub fn get_default_port(&self) -> u16 {
        self.default_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("peer-client-identity-{}-{}", tag, std::process::id()))
            .join("identity.json")
    }

    #[test]
    fn test_generate_keypair_sizes() {
        let identity = Identity::generate("alice", 0).unwrap();
        let (public, private) = identity.get_keypair();
        assert_eq!(public.len(), 32);
        assert!(!private.is_empty());
    }

    #[test]
    fn test_load_or_create_persists() {
        let path = temp_path("persist");
        let _ = fs::remove_dir_all(path.parent().unwrap());

        let created = Identity::load_or_create(&path, "alice").unwrap();
        assert!(path.exists());

        // Second call reads the same keypair back, ignoring the new name
        let loaded = Identity::load_or_create(&path, "bob").unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.name, "alice");

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_tampered_key_rejected() {
        let path = temp_path("tampered");
        let _ = fs::remove_dir_all(path.parent().unwrap());

        let mut identity = Identity::generate("mallory", 4144).unwrap();
        identity.public_key[0] ^= 0xff;
        identity.save(&path).unwrap();

        assert!(matches!(Identity::load(&path), Err(IdentityError::InvalidKey)));

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
