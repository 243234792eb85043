//! Key material. AUTH signs with whatever [`Keypair`] the pool holds;
//! gift wraps need a throwaway [`FullKeypair`] per wrap.

use std::fmt;

use crate::{Pubkey, SecretKey};

fn pubkey_of(secret_key: &SecretKey) -> Pubkey {
    let keys = nostr::Keys::new(secret_key.clone());
    Pubkey::new(keys.public_key().to_bytes())
}

/// A pubkey with an optional secret. Watch-only accounts can't answer
/// AUTH challenges.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Keypair {
    pub pubkey: Pubkey,
    pub secret_key: Option<SecretKey>,
}

impl Keypair {
    pub fn from_secret(secret_key: SecretKey) -> Self {
        Keypair {
            pubkey: pubkey_of(&secret_key),
            secret_key: Some(secret_key),
        }
    }

    pub fn only_pubkey(pubkey: Pubkey) -> Self {
        Keypair {
            pubkey,
            secret_key: None,
        }
    }

    /// Borrow both halves, if we have the secret
    pub fn as_filled(&self) -> Option<FilledKeypair<'_>> {
        let secret_key = self.secret_key.as_ref()?;
        Some(FilledKeypair {
            pubkey: &self.pubkey,
            secret_key,
        })
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct FullKeypair {
    pub pubkey: Pubkey,
    pub secret_key: SecretKey,
}

/// Borrowed view of a keypair known to have its secret
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct FilledKeypair<'a> {
    pub pubkey: &'a Pubkey,
    pub secret_key: &'a SecretKey,
}

impl FullKeypair {
    /// A fresh random keypair
    pub fn generate() -> Self {
        let mut rng = nostr::secp256k1::rand::rngs::OsRng;
        let (secret_key, _) = nostr::SECP256K1.generate_keypair(&mut rng);
        let secret_key = SecretKey::from(secret_key);
        FullKeypair {
            pubkey: pubkey_of(&secret_key),
            secret_key,
        }
    }

    pub fn to_filled(&self) -> FilledKeypair<'_> {
        FilledKeypair {
            pubkey: &self.pubkey,
            secret_key: &self.secret_key,
        }
    }

    pub fn to_keypair(self) -> Keypair {
        Keypair {
            pubkey: self.pubkey,
            secret_key: Some(self.secret_key),
        }
    }
}

impl fmt::Display for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret = if self.secret_key.is_some() {
            "<hidden>"
        } else {
            "none"
        };
        write!(f, "{} (secret: {})", self.pubkey, secret)
    }
}

impl fmt::Display for FullKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (secret: <hidden>)", self.pubkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_distinct_and_consistent() {
        let a = FullKeypair::generate();
        let b = FullKeypair::generate();
        assert_ne!(a.pubkey, b.pubkey);

        let derived = Keypair::from_secret(a.secret_key.clone());
        assert_eq!(derived.pubkey, a.pubkey);
        assert_eq!(derived.as_filled(), Some(a.to_filled()));
    }

    #[test]
    fn watch_only_has_nothing_to_fill() {
        let kp = Keypair::only_pubkey(FullKeypair::generate().pubkey);
        assert_eq!(kp.as_filled(), None);
        assert!(kp.to_string().ends_with("(secret: none)"));
    }

    #[test]
    fn display_hides_secret() {
        let kp = FullKeypair::generate();
        let shown = kp.to_string();
        assert!(shown.contains("<hidden>"));
        assert!(!shown.contains(&kp.secret_key.display_secret().to_string()));
    }
}
