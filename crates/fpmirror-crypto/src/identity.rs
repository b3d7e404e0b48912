//! Receiver identity management.
//!
//! The receiver proves who it is during setup by signing the response with a
//! long-lived Ed25519 key. Provisioning that key is outside this crate; it is
//! either handed in as raw bytes or read from a 0600 key file.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::error::FairPlayError;
use crate::wire::{PUBLIC_KEY_LEN, SIGNATURE_LEN};

/// The receiver's long-term Ed25519 signing identity.
pub struct ReceiverIdentity {
    signing: SigningKey,
}

impl std::fmt::Debug for ReceiverIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverIdentity")
            .field("public", &hex::encode(self.public_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl ReceiverIdentity {
    /// Fresh random identity from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct from a raw 32-byte Ed25519 secret.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, FairPlayError> {
        let mut arr = <[u8; 32]>::try_from(bytes).map_err(|_| FairPlayError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        let signing = SigningKey::from_bytes(&arr);
        arr.zeroize();
        Ok(Self { signing })
    }

    /// Raw 32-byte Ed25519 public key.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign `message` with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }

    /// Colon-separated SHA-256 fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.public_bytes())
    }

    /// Write the 32-byte secret to `path`, creating parent directories.
    ///
    /// On Unix the file is created owner-only (0600).
    pub fn save_to_file(&self, path: &Path) -> Result<(), FairPlayError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path)?;
        // `mode` only applies on creation; tighten a pre-existing file before writing.
        restrict_to_owner(&file)?;
        let secret = Zeroizing::new(self.signing.to_bytes());
        file.write_all(&*secret)?;
        Ok(())
    }

    /// Read an identity saved by [`save_to_file`](Self::save_to_file).
    ///
    /// On Unix, refuses files that group or others can access.
    pub fn load_from_file(path: &Path) -> Result<Self, FairPlayError> {
        check_owner_only(path)?;
        let mut secret = Zeroizing::new([0u8; 32]);
        fs::File::open(path)?.read_exact(&mut *secret)?;
        Self::from_secret_bytes(&*secret)
    }

    /// Load the identity at `path`, provisioning a new one if it is missing.
    pub fn load_or_generate(path: &Path) -> Result<Self, FairPlayError> {
        match fs::metadata(path) {
            Ok(_) => Self::load_from_file(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.save_to_file(path)?;
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn restrict_to_owner(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn check_owner_only(path: &Path) -> Result<(), FairPlayError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(FairPlayError::IoError(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "{}: identity key file has insecure permissions {mode:o}",
                path.display()
            ),
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_only(_path: &Path) -> Result<(), FairPlayError> {
    Ok(())
}

/// Verify an Ed25519 signature made by `public_key` over `message`.
pub fn verify_signature(
    public_key: &[u8; PUBLIC_KEY_LEN],
    message: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<(), FairPlayError> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| FairPlayError::CryptoFailure(format!("invalid peer identity key: {e}")))?;
    key.verify(message, &Signature::from_bytes(signature))
        .map_err(|e| FairPlayError::CryptoFailure(format!("signature verification failed: {e}")))
}

/// `aa:bb:..` rendering of SHA-256 over an Ed25519 public key.
pub fn fingerprint_of(public_key: &[u8; PUBLIC_KEY_LEN]) -> String {
    let digest = Sha256::digest(public_key);
    let mut out = String::with_capacity(digest.len() * 3);
    for (i, byte) in digest.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&hex::encode([*byte]));
    }
    out
}
