use std::fs;
use std::io::Write;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use russh_keys::PublicKeyBase64;
use russh_keys::key::{KeyPair, PublicKey};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{Error, Result};

/// SHA-256 fingerprint of a public key in the form `ssh-keygen -l` prints,
/// e.g. `SHA256:Fh3C...`. The same function is used at registration and at
/// authentication.
pub fn fingerprint_of(key: &PublicKey) -> String {
    let hash = Sha256::digest(key.public_key_bytes());
    format!("SHA256:{}", STANDARD_NO_PAD.encode(hash))
}

/// Parses one `authorized_keys` style line (`<type> <base64> [comment]`).
/// Returns the normalized `<type> <base64>` text and the fingerprint.
pub fn parse_authorized_key(line: &str) -> Result<(String, String)> {
    let mut parts = line.split_whitespace();
    let (Some(key_type), Some(encoded)) = (parts.next(), parts.next()) else {
        return Err(Error::InvalidKey(
            "expected '<type> <base64-key> [comment]'".to_string(),
        ));
    };

    let key = russh_keys::parse_public_key_base64(encoded)
        .map_err(|e| Error::InvalidKey(e.to_string()))?;

    if key.name() != key_type {
        return Err(Error::InvalidKey(format!(
            "key type {key_type} does not match encoded key {}",
            key.name()
        )));
    }

    Ok((format!("{key_type} {encoded}"), fingerprint_of(&key)))
}

/// Loads the daemon's host key, generating an Ed25519 key on first start.
/// New keys are written as PKCS#8 PEM readable only by the owner.
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        return russh_keys::load_secret_key(path, None).map_err(|e| {
            Error::Config(format!("failed to load SSH host key {}: {e}", path.display()))
        });
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let key = KeyPair::generate_ed25519();
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem)
        .map_err(|e| Error::Config(format!("failed to encode SSH host key: {e}")))?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)?.write_all(&pem)?;

    info!(path = %path.display(), "generated SSH host key");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn public_line(key: &KeyPair) -> String {
        let public = key.clone_public_key().unwrap();
        format!("{} {} test@host", public.name(), public.public_key_base64())
    }

    #[test]
    fn test_fingerprint_format() {
        let key = KeyPair::generate_ed25519();
        let fp = fingerprint_of(&key.clone_public_key().unwrap());

        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        // 32 byte digest without padding
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }

    #[test]
    fn test_parse_authorized_key_matches_fingerprint() {
        let key = KeyPair::generate_ed25519();
        let expected = fingerprint_of(&key.clone_public_key().unwrap());

        let (normalized, fp) = parse_authorized_key(&public_line(&key)).unwrap();
        assert_eq!(fp, expected);
        assert!(normalized.starts_with("ssh-ed25519 "));
        assert!(!normalized.contains("test@host"));
    }

    #[test]
    fn test_parse_authorized_key_rejects_garbage() {
        assert!(matches!(
            parse_authorized_key("ssh-ed25519"),
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(
            parse_authorized_key("ssh-ed25519 not-base64!!"),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn test_parse_authorized_key_rejects_type_mismatch() {
        let key = KeyPair::generate_ed25519();
        let line = public_line(&key).replacen("ssh-ed25519", "ssh-rsa", 1);
        assert!(matches!(
            parse_authorized_key(&line),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn test_host_key_is_generated_once() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("keys").join("ssh_host_key");

        let first = load_or_generate_host_key(&path).unwrap();
        assert!(path.is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let second = load_or_generate_host_key(&path).unwrap();
        assert_eq!(
            first.clone_public_key().unwrap().public_key_base64(),
            second.clone_public_key().unwrap().public_key_base64()
        );
    }
}
