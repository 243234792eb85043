use crate::signer::NoteSigner;
use crate::{Error, FilledKeypair, Pubkey};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NoteId([u8; 32]);

impl fmt::Debug for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl NoteId {
    pub fn new(bytes: [u8; 32]) -> Self {
        NoteId(bytes)
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.bytes())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        let evid = NoteId(hex::decode(hex_str)?.as_slice().try_into()?);
        Ok(evid)
    }
}

/// The canonical NIP-01 id: sha256 over `[0,pubkey,created_at,kind,tags,content]`
pub fn compute_id(
    pubkey: &Pubkey,
    created_at: u64,
    kind: u64,
    tags: &[Vec<String>],
    content: &str,
) -> NoteId {
    let commitment = serde_json::json!([0, pubkey.hex(), created_at, kind, tags, content]);
    let digest = Sha256::digest(commitment.to_string().as_bytes());
    NoteId(digest.into())
}

/// Event is the struct used to represent a Nostr event
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Note {
    /// 32-bytes sha256 of the the serialized event data
    pub id: NoteId,
    /// 32-bytes hex-encoded public key of the event creator
    pub pubkey: Pubkey,
    /// unix timestamp in seconds
    pub created_at: u64,
    /// integer
    /// 0: NostrEvent
    pub kind: u64,
    /// Tags
    pub tags: Vec<Vec<String>>,
    /// arbitrary string
    pub content: String,
    /// 64-bytes signature of the sha256 hash of the serialized event data, which is the same as the "id" field
    pub sig: String,
}

// Implement Hash trait
impl Hash for Note {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.0.hash(state);
    }
}

impl PartialEq for Note {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Note {}

impl Note {
    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(Into::into)
    }

    pub fn json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Recompute the id from the event fields
    pub fn has_valid_id(&self) -> bool {
        compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ) == self.id
    }

    pub fn verify(&self, signer: &dyn NoteSigner) -> Result<(), Error> {
        if signer.verify(self) {
            Ok(())
        } else {
            Err(Error::InvalidSignature)
        }
    }

    /// Values at index 1 of every tag named `name`
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }
}

impl std::str::FromStr for Note {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Note::from_json(s)
    }
}

/// An event without a signature. NIP-59 rumors travel in this form.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UnsignedNote {
    pub id: NoteId,
    pub pubkey: Pubkey,
    pub created_at: u64,
    pub kind: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedNote {
    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(Into::into)
    }

    pub fn json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Into::into)
    }

    pub fn has_valid_id(&self) -> bool {
        compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ) == self.id
    }

    pub fn sign(self, secret_key: &crate::SecretKey, signer: &dyn NoteSigner) -> Result<Note, Error> {
        let sig = signer.sign(&self, secret_key)?;
        Ok(Note {
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig),
        })
    }
}

pub struct NoteBuilder {
    kind: u64,
    content: String,
    tags: Vec<Vec<String>>,
    created_at: Option<u64>,
}

impl NoteBuilder {
    pub fn new(kind: u64) -> Self {
        NoteBuilder {
            kind,
            content: String::new(),
            tags: vec![],
            created_at: None,
        }
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn tag<I, S>(mut self, tag: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(tag.into_iter().map(Into::into).collect());
        self
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn build_unsigned(self, pubkey: Pubkey) -> UnsignedNote {
        let created_at = self.created_at.unwrap_or_else(unix_now);
        let id = compute_id(&pubkey, created_at, self.kind, &self.tags, &self.content);
        UnsignedNote {
            id,
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        }
    }

    pub fn sign(self, keypair: FilledKeypair<'_>, signer: &dyn NoteSigner) -> Result<Note, Error> {
        self.build_unsigned(*keypair.pubkey)
            .sign(keypair.secret_key, signer)
    }
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// Custom serialize function for NoteId
impl Serialize for NoteId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.hex())
    }
}

// Custom deserialize function for NoteId
impl<'de> Deserialize<'de> for NoteId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NoteId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::SchnorrSigner;
    use crate::FullKeypair;

    #[test]
    fn test_note_id_matches_nip01_commitment() {
        let pubkey = Pubkey::new([7; 32]);
        let tags = vec![vec!["p".to_string(), "abc".to_string()]];
        let id = compute_id(&pubkey, 1_700_000_000, 1, &tags, "hello \"world\"\n");

        let serialized = format!(
            r#"[0,"{}",1700000000,1,[["p","abc"]],"hello \"world\"\n"]"#,
            pubkey.hex()
        );
        let expected: [u8; 32] = Sha256::digest(serialized.as_bytes()).into();
        assert_eq!(id, NoteId::new(expected));
    }

    #[test]
    fn test_signed_note_roundtrips_and_verifies() {
        let kp = FullKeypair::generate();
        let note = NoteBuilder::new(1)
            .content("gm")
            .tag(["t", "nostr"])
            .created_at(42)
            .sign(kp.to_filled(), &SchnorrSigner)
            .unwrap();

        assert!(note.has_valid_id());
        assert!(note.verify(&SchnorrSigner).is_ok());

        let parsed = Note::from_json(&note.json().unwrap()).unwrap();
        assert_eq!(parsed.id, note.id);
        assert_eq!(parsed.sig, note.sig);
        assert_eq!(parsed.tag_values("t").collect::<Vec<_>>(), vec!["nostr"]);
    }

    #[test]
    fn test_tampered_content_fails_verification() {
        let kp = FullKeypair::generate();
        let mut note = NoteBuilder::new(1)
            .content("original")
            .sign(kp.to_filled(), &SchnorrSigner)
            .unwrap();
        note.content = "tampered".to_string();

        assert!(!note.has_valid_id());
        assert_eq!(note.verify(&SchnorrSigner), Err(Error::InvalidSignature));
    }
}
