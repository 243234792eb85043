//! NIP-17 private direct messages.
//!
//! A message is an unsigned kind 14 rumor, sealed (kind 13, signed by the
//! sender, NIP-44 encrypted to the recipient) and then gift wrapped (kind
//! 1059, signed by a throwaway key). Every message produces two wraps: one
//! for the recipient and one the sender keeps for their own history.

use nostr::nips::nip44;
use rand::Rng;
use thiserror::Error;

use crate::note::unix_now;
use crate::relay::RelayUrl;
use crate::{
    FilledKeypair, FullKeypair, Note, NoteBuilder, NoteId, NoteSigner, Pubkey, SecretKey,
    UnsignedNote,
};

pub const CHAT_KIND: u64 = 14;
pub const FILE_KIND: u64 = 15;
pub const SEAL_KIND: u64 = 13;
pub const GIFT_WRAP_KIND: u64 = 1059;
pub const DM_RELAY_LIST_KIND: u64 = 10050;

/// Wrap and seal timestamps are pushed back by up to this much
pub const TIMESTAMP_WINDOW: u64 = 2 * 24 * 60 * 60;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Nip17Error {
    #[error("not a gift wrap (kind {0})")]
    NotGiftWrap(u64),
    #[error("decryption failed")]
    Decryption,
    #[error("malformed seal")]
    MalformedSeal,
    #[error("seal signature does not verify")]
    InvalidSealSignature,
    #[error("malformed rumor")]
    MalformedRumor,
    #[error("rumor author does not match the seal signer")]
    SenderMismatch,
    #[error("unexpected kind {0}")]
    UnexpectedKind(u64),
    #[error("encryption failed")]
    Encryption,
    #[error("signing failed")]
    Signing,
}

/// The two gift wraps for one message, plus the rumor they carry
#[derive(Debug, Clone)]
pub struct WrappedMessage {
    pub rumor: UnsignedNote,
    /// Addressed to the recipient
    pub recipient_wrap: Note,
    /// Addressed back to the sender
    pub sender_wrap: Note,
}

/// Everything recovered from a gift wrap
#[derive(Debug, Clone)]
pub struct UnwrappedMessage {
    pub rumor: UnsignedNote,
    pub seal: Note,
}

impl UnwrappedMessage {
    /// The verified author of the message
    pub fn sender(&self) -> &Pubkey {
        &self.seal.pubkey
    }
}

/// A timestamp uniformly drawn from `[now - 2 days, now]`
pub fn random_timestamp(now: u64) -> u64 {
    now.saturating_sub(rand::rng().random_range(0..=TIMESTAMP_WINDOW))
}

/// Build the rumor and both gift wraps. `None` if any encryption or
/// signing step fails.
pub fn create_message(
    content: &str,
    to: &Pubkey,
    from: FilledKeypair<'_>,
    reply_to: Option<&NoteId>,
    signer: &dyn NoteSigner,
) -> Option<WrappedMessage> {
    try_create_message(content, to, from, reply_to, signer, unix_now()).ok()
}

pub fn try_create_message(
    content: &str,
    to: &Pubkey,
    from: FilledKeypair<'_>,
    reply_to: Option<&NoteId>,
    signer: &dyn NoteSigner,
    now: u64,
) -> Result<WrappedMessage, Nip17Error> {
    let mut builder = NoteBuilder::new(CHAT_KIND)
        .content(content)
        .created_at(now)
        .tag(["p", to.hex().as_str()]);
    if let Some(reply_to) = reply_to {
        builder = builder.tag(["e", reply_to.hex().as_str(), "", "reply"]);
    }
    let rumor = builder.build_unsigned(*from.pubkey);
    let rumor_json = rumor.json().map_err(|_| Nip17Error::MalformedRumor)?;

    let recipient_wrap = seal_and_wrap(&rumor_json, to, from, signer, now)?;
    let sender_wrap = seal_and_wrap(&rumor_json, from.pubkey, from, signer, now)?;

    Ok(WrappedMessage {
        rumor,
        recipient_wrap,
        sender_wrap,
    })
}

fn seal_and_wrap(
    rumor_json: &str,
    to: &Pubkey,
    from: FilledKeypair<'_>,
    signer: &dyn NoteSigner,
    now: u64,
) -> Result<Note, Nip17Error> {
    let sealed = encrypt(from.secret_key, to, rumor_json)?;
    let seal = NoteBuilder::new(SEAL_KIND)
        .content(sealed)
        .created_at(random_timestamp(now))
        .sign(from, signer)
        .map_err(|_| Nip17Error::Signing)?;
    let seal_json = seal.json().map_err(|_| Nip17Error::MalformedSeal)?;

    // single use, dropped once the wrap is signed
    let ephemeral = FullKeypair::generate();
    let wrapped = encrypt(&ephemeral.secret_key, to, &seal_json)?;
    NoteBuilder::new(GIFT_WRAP_KIND)
        .content(wrapped)
        .created_at(random_timestamp(now))
        .tag(["p", to.hex().as_str()])
        .sign(ephemeral.to_filled(), signer)
        .map_err(|_| Nip17Error::Signing)
}

fn encrypt(secret_key: &SecretKey, to: &Pubkey, plaintext: &str) -> Result<String, Nip17Error> {
    let to = to.to_nostr().map_err(|_| Nip17Error::Encryption)?;
    nip44::encrypt(secret_key, &to, plaintext, nip44::Version::V2)
        .map_err(|_| Nip17Error::Encryption)
}

fn decrypt(secret_key: &SecretKey, from: &Pubkey, payload: &str) -> Result<String, Nip17Error> {
    let from = from.to_nostr().map_err(|_| Nip17Error::Decryption)?;
    nip44::decrypt(secret_key, &from, payload).map_err(|_| Nip17Error::Decryption)
}

/// Recover the rumor from a gift wrap addressed to `recipient`. Any
/// failure, including a wrap meant for someone else, is `None`.
pub fn unwrap_gift_wrap(
    wrap: &Note,
    recipient: &SecretKey,
    signer: &dyn NoteSigner,
) -> Option<UnsignedNote> {
    try_unwrap_gift_wrap(wrap, recipient, signer)
        .ok()
        .map(|m| m.rumor)
}

pub fn try_unwrap_gift_wrap(
    wrap: &Note,
    recipient: &SecretKey,
    signer: &dyn NoteSigner,
) -> Result<UnwrappedMessage, Nip17Error> {
    if wrap.kind != GIFT_WRAP_KIND {
        return Err(Nip17Error::NotGiftWrap(wrap.kind));
    }

    let seal_json = decrypt(recipient, &wrap.pubkey, &wrap.content)?;
    let seal = Note::from_json(&seal_json).map_err(|_| Nip17Error::MalformedSeal)?;
    if seal.kind != SEAL_KIND {
        return Err(Nip17Error::UnexpectedKind(seal.kind));
    }
    seal.verify(signer)
        .map_err(|_| Nip17Error::InvalidSealSignature)?;

    let rumor_json = decrypt(recipient, &seal.pubkey, &seal.content)?;
    let rumor = UnsignedNote::from_json(&rumor_json).map_err(|_| Nip17Error::MalformedRumor)?;
    if rumor.pubkey != seal.pubkey {
        return Err(Nip17Error::SenderMismatch);
    }
    if rumor.kind != CHAT_KIND && rumor.kind != FILE_KIND {
        return Err(Nip17Error::UnexpectedKind(rumor.kind));
    }

    Ok(UnwrappedMessage { rumor, seal })
}

/// Kind 10050: the relays someone wants to receive DMs on
pub fn create_dm_relay_list(
    relays: &[RelayUrl],
    keypair: FilledKeypair<'_>,
    signer: &dyn NoteSigner,
) -> crate::Result<Note> {
    relays
        .iter()
        .fold(NoteBuilder::new(DM_RELAY_LIST_KIND), |b, relay| {
            b.tag(["relay", relay.as_str()])
        })
        .sign(keypair, signer)
}

/// Relays listed in a kind 10050 event. Anything else, or tags that don't
/// parse as relay urls, yield nothing.
pub fn parse_dm_relay_list(note: &Note) -> Vec<RelayUrl> {
    if note.kind != DM_RELAY_LIST_KIND {
        return vec![];
    }

    let mut relays: Vec<RelayUrl> = vec![];
    for value in note.tag_values("relay") {
        match RelayUrl::parse(value) {
            Ok(url) if !relays.contains(&url) => relays.push(url),
            Ok(_) => {}
            Err(_) => tracing::debug!("skipping bad dm relay '{}'", value),
        }
    }
    relays
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchnorrSigner;

    fn message(content: &str, from: &FullKeypair, to: &FullKeypair) -> WrappedMessage {
        create_message(content, &to.pubkey, from.to_filled(), None, &SchnorrSigner).unwrap()
    }

    #[test]
    fn wraps_are_addressed_and_ephemeral() {
        let alice = FullKeypair::generate();
        let bob = FullKeypair::generate();
        let msg = message("hi bob", &alice, &bob);

        assert_eq!(msg.rumor.kind, CHAT_KIND);
        assert_eq!(msg.rumor.pubkey, alice.pubkey);
        assert!(msg.rumor.has_valid_id());

        for (wrap, to) in [(&msg.recipient_wrap, &bob), (&msg.sender_wrap, &alice)] {
            assert_eq!(wrap.kind, GIFT_WRAP_KIND);
            assert_eq!(wrap.tag_values("p").collect::<Vec<_>>(), vec![to.pubkey.hex()]);
            assert_ne!(wrap.pubkey, alice.pubkey);
            assert!(wrap.verify(&SchnorrSigner).is_ok());
        }
        assert_ne!(msg.recipient_wrap.pubkey, msg.sender_wrap.pubkey);
    }

    #[test]
    fn both_sides_can_read() {
        let alice = FullKeypair::generate();
        let bob = FullKeypair::generate();
        let msg = message("gm", &alice, &bob);

        let by_bob = try_unwrap_gift_wrap(&msg.recipient_wrap, &bob.secret_key, &SchnorrSigner)
            .unwrap();
        assert_eq!(by_bob.rumor, msg.rumor);
        assert_eq!(by_bob.sender(), &alice.pubkey);

        let by_alice =
            unwrap_gift_wrap(&msg.sender_wrap, &alice.secret_key, &SchnorrSigner).unwrap();
        assert_eq!(by_alice.content, "gm");
    }

    #[test]
    fn reply_tag() {
        let alice = FullKeypair::generate();
        let bob = FullKeypair::generate();
        let parent = NoteId::new([7; 32]);
        let msg = create_message(
            "re",
            &bob.pubkey,
            alice.to_filled(),
            Some(&parent),
            &SchnorrSigner,
        )
        .unwrap();

        assert!(msg
            .rumor
            .tags
            .contains(&vec!["e".to_owned(), parent.hex(), String::new(), "reply".to_owned()]));
    }

    #[test]
    fn wrong_kind_and_wrong_key() {
        let alice = FullKeypair::generate();
        let bob = FullKeypair::generate();
        let eve = FullKeypair::generate();
        let msg = message("secret", &alice, &bob);

        assert_eq!(
            try_unwrap_gift_wrap(&msg.recipient_wrap, &eve.secret_key, &SchnorrSigner).unwrap_err(),
            Nip17Error::Decryption
        );

        let mut not_a_wrap = msg.recipient_wrap.clone();
        not_a_wrap.kind = 1;
        assert_eq!(
            try_unwrap_gift_wrap(&not_a_wrap, &bob.secret_key, &SchnorrSigner).unwrap_err(),
            Nip17Error::NotGiftWrap(1)
        );

        let mut garbage = msg.recipient_wrap.clone();
        garbage.content = String::new();
        assert!(unwrap_gift_wrap(&garbage, &bob.secret_key, &SchnorrSigner).is_none());
        garbage.content = "AgAAAA==".to_owned();
        assert!(unwrap_gift_wrap(&garbage, &bob.secret_key, &SchnorrSigner).is_none());
    }

    #[test]
    fn forged_rumor_author_is_rejected() {
        let mallory = FullKeypair::generate();
        let alice = FullKeypair::generate();
        let bob = FullKeypair::generate();

        // mallory seals a rumor claiming to be from alice
        let rumor = NoteBuilder::new(CHAT_KIND)
            .content("i am alice")
            .build_unsigned(alice.pubkey);
        let wrap = seal_and_wrap(
            &rumor.json().unwrap(),
            &bob.pubkey,
            mallory.to_filled(),
            &SchnorrSigner,
            unix_now(),
        )
        .unwrap();

        assert_eq!(
            try_unwrap_gift_wrap(&wrap, &bob.secret_key, &SchnorrSigner).unwrap_err(),
            Nip17Error::SenderMismatch
        );
    }

    #[test]
    fn random_timestamps_stay_in_window() {
        let now = 1_700_000_000;
        let stamps: Vec<u64> = (0..200).map(|_| random_timestamp(now)).collect();
        assert!(stamps
            .iter()
            .all(|t| *t <= now && *t >= now - TIMESTAMP_WINDOW));
        assert!(stamps.iter().any(|t| *t != stamps[0]));
        assert!(random_timestamp(5) <= 5);
    }

    #[test]
    fn dm_relay_list() {
        let alice = FullKeypair::generate();
        let relays = vec![
            RelayUrl::parse("wss://dm.one").unwrap(),
            RelayUrl::parse("wss://dm.two").unwrap(),
        ];
        let note = create_dm_relay_list(&relays, alice.to_filled(), &SchnorrSigner).unwrap();
        assert_eq!(note.kind, DM_RELAY_LIST_KIND);
        assert_eq!(parse_dm_relay_list(&note), relays);

        let mut wrong_kind = note.clone();
        wrong_kind.kind = 10002;
        assert!(parse_dm_relay_list(&wrong_kind).is_empty());

        let empty = create_dm_relay_list(&[], alice.to_filled(), &SchnorrSigner).unwrap();
        assert!(parse_dm_relay_list(&empty).is_empty());
    }
}
