//! Our reconciler against the reference `negentropy` crate, in both roles

use std::collections::BTreeSet;

use negentropy::{Id, Negentropy, NegentropyStorageVector};
use nostrnet::negentropy::{NegentropyReconciler, NegentropyStorage};
use nostrnet::{NegentropyConfig, NoteId};
use sha2::{Digest, Sha256};

fn item(n: u32) -> (u64, [u8; 32]) {
    let id: [u8; 32] = Sha256::digest(n.to_be_bytes()).into();
    // plenty of equal timestamps so the id prefix matters
    (1_700_000_000 + (n / 4) as u64, id)
}

fn ours(ns: &[u32], config: &NegentropyConfig) -> NegentropyReconciler {
    let mut storage = NegentropyStorage::new();
    for n in ns {
        let (ts, id) = item(*n);
        storage.add(ts, &NoteId::new(id)).unwrap();
    }
    storage.seal().unwrap();
    NegentropyReconciler::new(storage, config).unwrap()
}

fn theirs(ns: &[u32]) -> Negentropy<'static, NegentropyStorageVector> {
    let mut storage = NegentropyStorageVector::new();
    for n in ns {
        let (ts, id) = item(*n);
        storage.insert(ts, Id::from_byte_array(id)).unwrap();
    }
    storage.seal().unwrap();
    Negentropy::owned(storage, 0).unwrap()
}

fn ids(ns: impl IntoIterator<Item = u32>) -> BTreeSet<[u8; 32]> {
    ns.into_iter().map(|n| item(n).1).collect()
}

fn split(total: u32) -> (Vec<u32>, Vec<u32>) {
    let client = (0..total).filter(|n| n % 3 != 0).collect();
    let relay = (0..total).filter(|n| n % 5 != 0).collect();
    (client, relay)
}

fn only_in(a: &[u32], b: &[u32]) -> BTreeSet<[u8; 32]> {
    ids(a.iter().copied().filter(|n| !b.contains(n)))
}

#[test]
fn our_initiator_against_reference_responder() {
    for total in [0, 10, 200, 2_000] {
        let (client, relay) = split(total);
        let mut client_neg = ours(&client, &NegentropyConfig::default());
        let mut relay_neg = theirs(&relay);

        let mut msg = client_neg.initiate();
        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(rounds < 50, "no convergence for {total} items");
            let reply = relay_neg.reconcile(&msg).unwrap();
            match client_neg.reconcile(&reply).unwrap() {
                Some(next) => msg = next,
                None => break,
            }
        }

        let have: BTreeSet<_> = client_neg.have_ids().iter().map(|id| *id.bytes()).collect();
        let need: BTreeSet<_> = client_neg.need_ids().iter().map(|id| *id.bytes()).collect();
        assert_eq!(have, only_in(&client, &relay), "have for {total} items");
        assert_eq!(need, only_in(&relay, &client), "need for {total} items");
    }
}

#[test]
fn reference_initiator_against_our_responder() {
    for total in [0, 10, 200, 2_000] {
        let (client, relay) = split(total);
        let mut client_neg = theirs(&client);
        let mut relay_neg = ours(&relay, &NegentropyConfig::default());

        let mut have = vec![];
        let mut need = vec![];
        let mut msg = client_neg.initiate().unwrap();
        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(rounds < 50, "no convergence for {total} items");
            let reply = relay_neg.reconcile(&msg).unwrap().expect("responder always answers");
            match client_neg
                .reconcile_with_ids(&reply, &mut have, &mut need)
                .unwrap()
            {
                Some(next) => msg = next,
                None => break,
            }
        }

        let have: BTreeSet<_> = have.iter().map(|id| id.to_bytes()).collect();
        let need: BTreeSet<_> = need.iter().map(|id| id.to_bytes()).collect();
        assert_eq!(have, only_in(&client, &relay), "have for {total} items");
        assert_eq!(need, only_in(&relay, &client), "need for {total} items");
    }
}

#[test]
fn identical_sets_finish_after_one_exchange() {
    let set: Vec<u32> = (0..500).collect();
    let mut client_neg = ours(&set, &NegentropyConfig::default());
    let mut relay_neg = theirs(&set);

    let reply = relay_neg.reconcile(&client_neg.initiate()).unwrap();
    assert_eq!(client_neg.reconcile(&reply).unwrap(), None);
    assert!(client_neg.have_ids().is_empty());
    assert!(client_neg.need_ids().is_empty());
}
