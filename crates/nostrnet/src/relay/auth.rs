//! NIP-42 client authentication

use crate::relay::RelayUrl;
use crate::{Keypair, Note, NoteBuilder, NoteSigner};

pub const AUTH_KIND: u64 = 22242;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// The pool has no account to authenticate as
    NoKey,
    /// The account is watch-only
    NoPrivateKey,
    SigningFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    None,
    Pending,
    Verified,
    Error(AuthError),
}

/// Build the signed kind 22242 answer to `challenge` from `relay`
pub fn make_auth_request(
    keypair: Option<&Keypair>,
    relay: &RelayUrl,
    challenge: &str,
    signer: &dyn NoteSigner,
) -> Result<Note, AuthError> {
    let keypair = keypair.ok_or(AuthError::NoKey)?;
    let filled = keypair.as_filled().ok_or(AuthError::NoPrivateKey)?;

    NoteBuilder::new(AUTH_KIND)
        .tag(["relay", relay.as_str()])
        .tag(["challenge", challenge])
        .sign(filled, signer)
        .map_err(|e| {
            tracing::error!("failed to sign auth for {}: {}", relay, e);
            AuthError::SigningFailed
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FullKeypair, SchnorrSigner};

    #[test]
    fn auth_event_shape() {
        let kp = FullKeypair::generate();
        let keypair = Keypair::from_secret(kp.secret_key.clone());
        let relay = RelayUrl::parse("wss://auth.example.com/").unwrap();

        let note = make_auth_request(Some(&keypair), &relay, "chal", &SchnorrSigner).unwrap();
        assert_eq!(note.kind, AUTH_KIND);
        assert_eq!(note.pubkey, kp.pubkey);
        assert_eq!(note.tag_values("relay").collect::<Vec<_>>(), vec!["wss://auth.example.com"]);
        assert_eq!(note.tag_values("challenge").collect::<Vec<_>>(), vec!["chal"]);
        assert!(note.verify(&SchnorrSigner).is_ok());
    }

    #[test]
    fn missing_keys() {
        let relay = RelayUrl::parse("wss://auth.example.com").unwrap();
        assert_eq!(
            make_auth_request(None, &relay, "c", &SchnorrSigner).unwrap_err(),
            AuthError::NoKey
        );

        let watch_only = Keypair::only_pubkey(FullKeypair::generate().pubkey);
        assert_eq!(
            make_auth_request(Some(&watch_only), &relay, "c", &SchnorrSigner).unwrap_err(),
            AuthError::NoPrivateKey
        );
    }
}
