//! Signature capability used by the handshake.

use crate::config::{APP_KEY_SIZE, SALT_SIZE, SIGNATURE_SIZE};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub type Salt = [u8; SALT_SIZE];
pub type Signature = [u8; SIGNATURE_SIZE];

type HmacSha256 = Hmac<Sha256>;

/// Produces the signature proving the scanner knows the application key.
pub trait Signer {
    fn sign(&self, salt: &Salt, time: u32) -> Option<Signature>;

    /// Check a signature produced by the peer over our own salt.
    fn verify(&self, salt: &Salt, time: u32, signature: &Signature) -> bool {
        self.sign(salt, time).is_some_and(|expected| expected == *signature)
    }
}

/// HMAC-SHA256 keyed with the application key, over `salt || time_le`.
pub struct HmacSigner {
    key: [u8; APP_KEY_SIZE],
}

impl HmacSigner {
    pub const fn new(key: [u8; APP_KEY_SIZE]) -> Self {
        Self { key }
    }
}

impl Signer for HmacSigner {
    fn sign(&self, salt: &Salt, time: u32) -> Option<Signature> {
        let mut mac = HmacSha256::new_from_slice(&self.key).ok()?;
        mac.update(salt);
        mac.update(&time.to_le_bytes());
        Some(mac.finalize().into_bytes().into())
    }

    fn verify(&self, salt: &Salt, time: u32, signature: &Signature) -> bool {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            return false;
        };
        mac.update(salt);
        mac.update(&time.to_le_bytes());
        mac.verify_slice(signature).is_ok()
    }
}

impl<S: Signer + ?Sized> Signer for &S {
    fn sign(&self, salt: &Salt, time: u32) -> Option<Signature> {
        (**self).sign(salt, time)
    }

    fn verify(&self, salt: &Salt, time: u32, signature: &Signature) -> bool {
        (**self).verify(salt, time, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_depends_on_salt_and_time() {
        let signer = HmacSigner::new([0x11; APP_KEY_SIZE]);
        let a = signer.sign(&[1; SALT_SIZE], 1000).unwrap();
        let b = signer.sign(&[1; SALT_SIZE], 1001).unwrap();
        let c = signer.sign(&[2; SALT_SIZE], 1000).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, signer.sign(&[1; SALT_SIZE], 1000).unwrap());
    }

    #[test]
    fn signature_matches_one_shot_hmac() {
        let key = [0x42; APP_KEY_SIZE];
        let salt = [0xA5; SALT_SIZE];
        let mut msg = [0u8; SALT_SIZE + 4];
        msg[..SALT_SIZE].copy_from_slice(&salt);
        msg[SALT_SIZE..].copy_from_slice(&7u32.to_le_bytes());

        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(&msg);
        let expected: Signature = mac.finalize().into_bytes().into();

        assert_eq!(HmacSigner::new(key).sign(&salt, 7), Some(expected));
    }

    #[test]
    fn different_keys_disagree() {
        let salt = [0; SALT_SIZE];
        assert_ne!(
            HmacSigner::new([1; APP_KEY_SIZE]).sign(&salt, 0),
            HmacSigner::new([2; APP_KEY_SIZE]).sign(&salt, 0)
        );
    }

    #[test]
    fn verify_accepts_only_the_exact_signature() {
        let signer = HmacSigner::new([0x5A; APP_KEY_SIZE]);
        let salt = [0x77; SALT_SIZE];
        let mut signature = signer.sign(&salt, 42).unwrap();
        assert!(signer.verify(&salt, 42, &signature));
        assert!(!signer.verify(&salt, 43, &signature));
        signature[31] ^= 1;
        assert!(!signer.verify(&salt, 42, &signature));
    }
}
