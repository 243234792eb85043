//! The sign/verify capability. Everything above this layer treats
//! signatures as opaque; tests and alternative backends can swap the
//! implementation through [`NoteSigner`].

use nostr::secp256k1::{schnorr, Keypair as SecpKeypair, Message, XOnlyPublicKey};

use crate::{Error, Note, SecretKey, UnsignedNote};

pub trait NoteSigner: Send + Sync {
    /// Sign the event id with `secret_key`, returning the 64 byte signature
    fn sign(&self, note: &UnsignedNote, secret_key: &SecretKey) -> Result<[u8; 64], Error>;

    /// Check the id commitment and the signature over it
    fn verify(&self, note: &Note) -> bool;
}

/// BIP-340 signatures over the NIP-01 event id
#[derive(Debug, Default, Clone, Copy)]
pub struct SchnorrSigner;

impl NoteSigner for SchnorrSigner {
    fn sign(&self, note: &UnsignedNote, secret_key: &SecretKey) -> Result<[u8; 64], Error> {
        let keypair = SecpKeypair::from_secret_key(&nostr::SECP256K1, secret_key);
        let (xonly, _parity) = keypair.x_only_public_key();
        if xonly.serialize() != *note.pubkey.bytes() {
            return Err(Error::InvalidSecretKey);
        }

        let msg = Message::from_digest(*note.id.bytes());
        let sig = nostr::SECP256K1.sign_schnorr_no_aux_rand(&msg, &keypair);
        Ok(sig.serialize())
    }

    fn verify(&self, note: &Note) -> bool {
        if !note.has_valid_id() {
            return false;
        }

        let Ok(sig_bytes) = hex::decode(&note.sig) else {
            return false;
        };
        let Ok(sig) = schnorr::Signature::from_slice(&sig_bytes) else {
            return false;
        };
        let Ok(pubkey) = XOnlyPublicKey::from_slice(note.pubkey.bytes()) else {
            return false;
        };

        let msg = Message::from_digest(*note.id.bytes());
        nostr::SECP256K1.verify_schnorr(&sig, &msg, &pubkey).is_ok()
    }
}
