use hashbrown::HashSet;
use tracing::{debug, trace};

use super::encoding::{Bound, Decoder, Encoder, Range, RangePayload, ID_SIZE};
use super::storage::NegentropyStorage;
use super::{NegentropyConfig, NegentropyError};
use crate::NoteId;

/// Room left in a frame for the fallback range and the hex framing
const FRAME_SLACK: usize = 200;
const MIN_FRAME_SIZE_LIMIT: u64 = 4096;

/// One side of a negentropy session.
///
/// The client calls [`initiate`](Self::initiate) and feeds every relay
/// reply to [`reconcile`](Self::reconcile) until it returns `None`. A
/// responder only ever calls `reconcile`, and always answers.
#[derive(Debug)]
pub struct NegentropyReconciler {
    storage: NegentropyStorage,
    frame_size_limit: usize,
    id_list_threshold: usize,
    split_count: usize,
    is_initiator: bool,
    complete: bool,
    have_ids: Vec<NoteId>,
    need_ids: Vec<NoteId>,
    seen_have: HashSet<[u8; ID_SIZE]>,
    seen_need: HashSet<[u8; ID_SIZE]>,
}

impl NegentropyReconciler {
    pub fn new(
        storage: NegentropyStorage,
        config: &NegentropyConfig,
    ) -> Result<Self, NegentropyError> {
        if !storage.is_sealed() {
            return Err(NegentropyError::StorageNotSealed);
        }
        let limit = config.frame_size_limit;
        if limit != 0 && limit < MIN_FRAME_SIZE_LIMIT {
            return Err(NegentropyError::InvalidFrameSizeLimit(limit));
        }

        Ok(Self {
            storage,
            frame_size_limit: limit as usize,
            id_list_threshold: config.id_list_threshold,
            split_count: config.split_count.max(2),
            is_initiator: false,
            complete: false,
            have_ids: vec![],
            need_ids: vec![],
            seen_have: HashSet::new(),
            seen_need: HashSet::new(),
        })
    }

    pub fn storage(&self) -> &NegentropyStorage {
        &self.storage
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Ids we hold that the other side is missing
    pub fn have_ids(&self) -> &[NoteId] {
        &self.have_ids
    }

    /// Ids the other side holds that we are missing
    pub fn need_ids(&self) -> &[NoteId] {
        &self.need_ids
    }

    /// Opening message: one fingerprint over the whole set
    pub fn initiate(&mut self) -> Vec<u8> {
        self.is_initiator = true;
        self.complete = false;

        let mut out = Encoder::with_version();
        out.write_range(&Range {
            upper: Bound::infinity(),
            payload: RangePayload::Fingerprint(self.storage.fingerprint(0, self.storage.len())),
        });
        out.into_bytes()
    }

    pub fn initiate_hex(&mut self) -> String {
        hex::encode(self.initiate())
    }

    /// Process one message from the other side.
    ///
    /// For the initiator `Ok(None)` means both sets are reconciled and
    /// nothing more needs to be sent.
    pub fn reconcile(&mut self, msg: &[u8]) -> Result<Option<Vec<u8>>, NegentropyError> {
        let mut dec = Decoder::new(msg)?;
        let mut out = Encoder::with_version();
        let mut pending_skip: Option<Bound> = None;
        let mut lower = 0usize;

        while !dec.is_empty() {
            let range = dec.read_range()?;
            let upper = self.storage.lower_bound(&range.upper).max(lower);
            let skip_before = pending_skip;
            let mut scratch = out.clone();

            match range.payload {
                RangePayload::Skip => pending_skip = Some(range.upper),

                RangePayload::Fingerprint(theirs) => {
                    if theirs == self.storage.fingerprint(lower, upper) {
                        pending_skip = Some(range.upper);
                    } else {
                        flush_skip(&mut scratch, &mut pending_skip);
                        self.split_range(&mut scratch, lower, upper, range.upper);
                    }
                }

                RangePayload::IdList(theirs) => {
                    self.diff_id_list(lower, upper, &theirs);
                    if self.is_initiator {
                        pending_skip = Some(range.upper);
                    } else {
                        flush_skip(&mut scratch, &mut pending_skip);

                        let cut = match self.id_budget(scratch.len()) {
                            Some(max) if upper - lower > max => lower + max,
                            _ => upper,
                        };
                        let bound = match self.storage.get(cut) {
                            Some(next) if cut < upper => Bound::from_id(next.timestamp, &next.id),
                            _ => range.upper,
                        };
                        scratch.write_range(&Range {
                            upper: bound,
                            payload: RangePayload::IdList(self.ids(lower, cut)),
                        });

                        if cut < upper {
                            trace!("negentropy id list cut at {} of {}", cut - lower, upper - lower);
                            scratch.write_range(&Range {
                                upper: Bound::infinity(),
                                payload: RangePayload::Fingerprint(
                                    self.storage.fingerprint(cut, self.storage.len()),
                                ),
                            });
                            out = scratch;
                            break;
                        }
                    }
                }

                RangePayload::IdListResponse { have_ids, bitfield } => {
                    for id in &have_ids {
                        self.add_need(id);
                    }
                    for (bit, i) in (lower..upper).enumerate() {
                        let Some(byte) = bitfield.get(bit / 8) else {
                            break;
                        };
                        if byte & (1 << (bit % 8)) != 0 {
                            let id = self.storage.items()[i].id;
                            self.add_have(&id);
                        }
                    }
                    pending_skip = Some(range.upper);
                }
            }

            if self.frame_size_limit != 0
                && scratch.len() > self.frame_size_limit.saturating_sub(FRAME_SLACK)
            {
                trace!(
                    "negentropy frame full at {} bytes, deferring items {}..",
                    scratch.len(),
                    lower
                );
                let mut skip = skip_before;
                flush_skip(&mut out, &mut skip);
                out.write_range(&Range {
                    upper: Bound::infinity(),
                    payload: RangePayload::Fingerprint(
                        self.storage.fingerprint(lower, self.storage.len()),
                    ),
                });
                break;
            }

            out = scratch;
            lower = upper;
        }

        // a trailing skip is implied and never written
        if self.is_initiator && out.len() == 1 {
            debug!(
                "negentropy reconciliation complete: have {} need {}",
                self.have_ids.len(),
                self.need_ids.len()
            );
            self.complete = true;
            return Ok(None);
        }

        Ok(Some(out.into_bytes()))
    }

    pub fn reconcile_hex(&mut self, msg: &str) -> Result<Option<String>, NegentropyError> {
        let bytes = hex::decode(msg).map_err(|_| NegentropyError::InvalidHex)?;
        Ok(self.reconcile(&bytes)?.map(hex::encode))
    }

    fn ids(&self, lower: usize, upper: usize) -> Vec<[u8; ID_SIZE]> {
        self.storage.items()[lower..upper]
            .iter()
            .map(|item| item.id)
            .collect()
    }

    /// How many ids still fit in the frame, `None` when unlimited
    fn id_budget(&self, used: usize) -> Option<usize> {
        if self.frame_size_limit == 0 {
            return None;
        }
        // bound, mode and count
        let overhead = 48;
        let avail = self
            .frame_size_limit
            .saturating_sub(FRAME_SLACK + overhead)
            .saturating_sub(used);
        Some(avail / ID_SIZE)
    }

    fn split_range(&self, out: &mut Encoder, lower: usize, upper: usize, upper_bound: Bound) {
        let count = upper - lower;
        if count <= self.id_list_threshold {
            out.write_range(&Range {
                upper: upper_bound,
                payload: RangePayload::IdList(self.ids(lower, upper)),
            });
            return;
        }

        let per = (count / self.split_count).max(1);
        let mut s_lower = lower;
        for i in 0..self.split_count {
            let s_upper = if i + 1 == self.split_count {
                upper
            } else {
                (s_lower + per).min(upper)
            };

            let bound = match self.storage.get(s_upper) {
                Some(next) if s_upper < upper => Bound::from_id(next.timestamp, &next.id),
                _ => upper_bound,
            };

            out.write_range(&Range {
                upper: bound,
                payload: RangePayload::Fingerprint(self.storage.fingerprint(s_lower, s_upper)),
            });

            s_lower = s_upper;
            if s_upper >= upper {
                break;
            }
        }
    }

    fn diff_id_list(&mut self, lower: usize, upper: usize, theirs: &[[u8; ID_SIZE]]) {
        let ours = self.ids(lower, upper);
        let ours_set: HashSet<&[u8; ID_SIZE]> = ours.iter().collect();
        let theirs_set: HashSet<&[u8; ID_SIZE]> = theirs.iter().collect();

        for id in theirs {
            if !ours_set.contains(id) {
                self.add_need(id);
            }
        }
        for id in &ours {
            if !theirs_set.contains(id) {
                self.add_have(id);
            }
        }
    }

    fn add_have(&mut self, id: &[u8; ID_SIZE]) {
        if self.seen_have.insert(*id) {
            self.have_ids.push(NoteId::new(*id));
        }
    }

    fn add_need(&mut self, id: &[u8; ID_SIZE]) {
        if self.seen_need.insert(*id) {
            self.need_ids.push(NoteId::new(*id));
        }
    }
}

fn flush_skip(out: &mut Encoder, pending: &mut Option<Bound>) {
    if let Some(upper) = pending.take() {
        out.write_range(&Range {
            upper,
            payload: RangePayload::Skip,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negentropy::encoding::PROTOCOL_VERSION;
    use std::collections::BTreeSet;

    fn id_for(n: u32) -> NoteId {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&n.to_be_bytes());
        bytes[31] = (n % 251) as u8;
        NoteId::new(bytes)
    }

    fn storage(ns: impl IntoIterator<Item = u32>) -> NegentropyStorage {
        let mut s = NegentropyStorage::new();
        for n in ns {
            // a handful of items share a timestamp so prefixes matter
            s.add(1_700_000_000 + (n / 3) as u64, &id_for(n)).unwrap();
        }
        s.seal().unwrap();
        s
    }

    struct Outcome {
        have: BTreeSet<NoteId>,
        need: BTreeSet<NoteId>,
        rounds: usize,
        max_msg: usize,
    }

    fn run(client: NegentropyStorage, relay: NegentropyStorage, cfg: &NegentropyConfig) -> Outcome {
        let mut client = NegentropyReconciler::new(client, cfg).unwrap();
        let mut relay = NegentropyReconciler::new(relay, cfg).unwrap();

        let mut msg = client.initiate();
        let mut max_msg = msg.len();
        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(rounds < 100, "reconciliation did not converge");

            let reply = relay.reconcile(&msg).unwrap().expect("responder always replies");
            max_msg = max_msg.max(reply.len());
            match client.reconcile(&reply).unwrap() {
                Some(next) => {
                    max_msg = max_msg.max(next.len());
                    msg = next;
                }
                None => break,
            }
        }

        assert!(client.is_complete());
        assert!(!relay.is_initiator());
        Outcome {
            have: client.have_ids().iter().copied().collect(),
            need: client.need_ids().iter().copied().collect(),
            rounds,
            max_msg,
        }
    }

    #[test]
    fn identical_sets_finish_in_one_round() {
        let out = run(storage(0..500), storage(0..500), &NegentropyConfig::default());
        assert!(out.have.is_empty());
        assert!(out.need.is_empty());
        assert_eq!(out.rounds, 1);
    }

    #[test]
    fn small_sets_use_id_lists() {
        let out = run(storage([1, 2, 3]), storage([2, 3, 4]), &NegentropyConfig::default());
        assert_eq!(out.have, [id_for(1)].into_iter().collect());
        assert_eq!(out.need, [id_for(4)].into_iter().collect());
    }

    #[test]
    fn large_sets_split_and_converge() {
        let client: Vec<u32> = (0..3000).filter(|n| n % 97 != 0).collect();
        let relay: Vec<u32> = (0..3000).filter(|n| n % 89 != 0).collect();

        let expect_have: BTreeSet<_> = (0..3000)
            .filter(|n| n % 89 == 0 && n % 97 != 0)
            .map(id_for)
            .collect();
        let expect_need: BTreeSet<_> = (0..3000)
            .filter(|n| n % 97 == 0 && n % 89 != 0)
            .map(id_for)
            .collect();

        let out = run(storage(client), storage(relay), &NegentropyConfig::default());
        assert_eq!(out.have, expect_have);
        assert_eq!(out.need, expect_need);
    }

    #[test]
    fn empty_client_needs_everything() {
        let out = run(storage(0..0), storage(0..40), &NegentropyConfig::default());
        assert!(out.have.is_empty());
        assert_eq!(out.need.len(), 40);
    }

    #[test]
    fn frame_size_limit_is_respected() {
        let cfg = NegentropyConfig {
            frame_size_limit: 4096,
            ..Default::default()
        };
        let out = run(storage(0..0), storage(0..2000), &cfg);
        assert_eq!(out.need.len(), 2000);
        assert!(out.max_msg <= 4096, "message of {} bytes", out.max_msg);
        assert!(out.rounds > 1);
    }

    #[test]
    fn config_is_validated() {
        let cfg = NegentropyConfig {
            frame_size_limit: 1000,
            ..Default::default()
        };
        assert_eq!(
            NegentropyReconciler::new(storage(0..0), &cfg).unwrap_err(),
            NegentropyError::InvalidFrameSizeLimit(1000)
        );

        assert_eq!(
            NegentropyReconciler::new(NegentropyStorage::new(), &NegentropyConfig::default())
                .unwrap_err(),
            NegentropyError::StorageNotSealed
        );
    }

    #[test]
    fn initiate_of_empty_set() {
        let mut neg = NegentropyReconciler::new(storage(0..0), &NegentropyConfig::default()).unwrap();
        let msg = neg.initiate_hex();
        // version, infinite bound with empty prefix, fingerprint mode
        assert!(msg.starts_with("61000001"));
        assert_eq!(msg.len(), (4 + 16) * 2);
        assert!(neg.is_initiator());
    }

    #[test]
    fn bad_input_is_an_error() {
        let mut neg = NegentropyReconciler::new(storage(0..0), &NegentropyConfig::default()).unwrap();
        assert_eq!(neg.reconcile_hex("zz"), Err(NegentropyError::InvalidHex));
        assert_eq!(
            neg.reconcile(&[0x60]),
            Err(NegentropyError::UnsupportedVersion(0x60))
        );
        // bound then an unknown mode
        assert_eq!(
            neg.reconcile(&[PROTOCOL_VERSION, 0x00, 0x00, 0x07]),
            Err(NegentropyError::UnknownMode(7))
        );
    }

    #[test]
    fn id_list_response_is_understood() {
        let mut neg = NegentropyReconciler::new(storage([1, 2, 3]), &NegentropyConfig::default())
            .unwrap();
        neg.initiate();

        let mut enc = Encoder::with_version();
        enc.write_range(&Range {
            upper: Bound::infinity(),
            payload: RangePayload::IdListResponse {
                have_ids: vec![*id_for(9).bytes()],
                // relay wants our second item
                bitfield: vec![0b010],
            },
        });

        assert_eq!(neg.reconcile(&enc.into_bytes()).unwrap(), None);
        assert_eq!(neg.need_ids(), &[id_for(9)]);
        assert_eq!(neg.have_ids(), &[id_for(2)]);
    }
}
