use std::cmp;
use std::collections::VecDeque;

use crate::key::Key;
use crate::node::contact::Contact;
use crate::{REPLICATION_PARAM, ROUTING_TABLE_SIZE};

/// A k-bucket with a maximum capacity of `REPLICATION_PARAM` contacts.
///
/// Contacts are kept in liveness order: the most recently seen contact at
/// the front, the least recently seen at the back.
#[derive(Clone, Debug, Default)]
struct Bucket {
    contacts: VecDeque<Contact>,
}

impl Bucket {
    fn position(&self, id: &Key) -> Option<usize> {
        self.contacts.iter().position(|contact| contact.id == *id)
    }

    fn move_to_front(&mut self, index: usize) {
        if let Some(contact) = self.contacts.remove(index) {
            self.contacts.push_front(contact);
        }
    }

    fn push_front(&mut self, contact: Contact) {
        self.contacts.push_front(contact);
    }

    fn is_full(&self) -> bool {
        self.contacts.len() >= REPLICATION_PARAM
    }

    /// The least recently seen contact, the eviction candidate when the
    /// bucket is full.
    fn least_recently_seen(&self) -> Option<&Contact> {
        self.contacts.back()
    }

    fn remove(&mut self, id: &Key) -> Option<Contact> {
        self.position(id).and_then(|index| self.contacts.remove(index))
    }

    /// Clones the bucket contents with each contact's distance to `target`
    /// filled in.
    fn contacts_with_distance(&self, target: &Key) -> Vec<Contact> {
        self.contacts
            .iter()
            .map(|contact| {
                let mut contact = contact.clone();
                contact.calc_distance(target);
                contact
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.contacts.len()
    }
}

/// A node's routing table: one bucket per bit of the identifier, indexed by
/// the position of the most significant bit in which a peer's ID differs
/// from our own.
///
/// The table itself is lock-free; the owning node wraps it in a single
/// readers-writer lock and never holds that lock across a network probe.
#[derive(Clone, Debug)]
pub struct RoutingTable {
    me: Contact,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    /// Constructs an empty routing table owned by `me`.
    pub fn new(me: Contact) -> Self {
        RoutingTable {
            me,
            buckets: vec![Bucket::default(); ROUTING_TABLE_SIZE],
        }
    }

    /// Upserts a contact.
    ///
    /// A contact already present is moved to the front of its bucket. A new
    /// contact joins a non-full bucket at the front. When the bucket is
    /// full, nothing is mutated and the bucket's least recently seen
    /// contact is returned; the caller probes it off-lock and decides
    /// between `remove_contact` + retry and keeping the old entry.
    pub fn add_contact(&mut self, contact: Contact) -> Option<Contact> {
        if contact.id == self.me.id {
            return None;
        }
        let bucket = &mut self.buckets[bucket_index(&self.me.id, &contact.id)];
        if let Some(index) = bucket.position(&contact.id) {
            bucket.move_to_front(index);
            None
        } else if !bucket.is_full() {
            bucket.push_front(contact);
            None
        } else {
            bucket.least_recently_seen().cloned()
        }
    }

    /// Removes the contact with the given ID, if present.
    pub fn remove_contact(&mut self, id: &Key) {
        self.buckets[bucket_index(&self.me.id, id)].remove(id);
    }

    /// Returns up to `count` contacts, closest to `target` first.
    ///
    /// Buckets are gathered radially around the target's bucket until
    /// enough candidates are collected; the exact ordering is enforced by
    /// sorting on the per-contact distance, with ties broken by ID.
    pub fn find_closest(&self, target: &Key, count: usize) -> Vec<Contact> {
        let index = bucket_index(&self.me.id, target);
        let mut candidates = self.buckets[index].contacts_with_distance(target);

        let mut i = 1;
        while (i <= index || index + i < ROUTING_TABLE_SIZE) && candidates.len() < count {
            if i <= index {
                candidates.extend(self.buckets[index - i].contacts_with_distance(target));
            }
            if index + i < ROUTING_TABLE_SIZE {
                candidates.extend(self.buckets[index + i].contacts_with_distance(target));
            }
            i += 1;
        }

        candidates.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        candidates.truncate(count);
        candidates
    }

    /// Total number of stored contacts, for diagnostics.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.len() == 0)
    }

    #[cfg(test)]
    fn bucket_len(&self, index: usize) -> usize {
        self.buckets[index].len()
    }
}

/// The bucket index for `id` relative to `me`: the index of the most
/// significant differing bit. `id == me` maps to the last bucket, though
/// the own ID is never stored.
fn bucket_index(me: &Key, id: &Key) -> usize {
    cmp::min(me.xor(id).leading_zeros(), ROUTING_TABLE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::{bucket_index, RoutingTable};
    use crate::key::Key;
    use crate::node::contact::Contact;
    use crate::{REPLICATION_PARAM, ROUTING_TABLE_SIZE};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn contact(id: Key, port: u16) -> Contact {
        Contact::new(id, addr(port))
    }

    #[test]
    fn test_add_and_find() {
        let me = contact(Key::random(), 1);
        let mut table = RoutingTable::new(me.clone());
        let peer = contact(Key::random(), 2);
        assert!(table.add_contact(peer.clone()).is_none());

        let closest = table.find_closest(&peer.id, REPLICATION_PARAM);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id, peer.id);
        assert_eq!(closest[0].distance, Some(Key::default()));
    }

    #[test]
    fn test_self_is_never_stored() {
        let me = contact(Key::random(), 1);
        let mut table = RoutingTable::new(me.clone());
        assert!(table.add_contact(me.clone()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_bucket_capacity_and_eviction_candidate() {
        let me = contact(Key::new([0u8; 20]), 1);
        let mut table = RoutingTable::new(me);

        // All IDs with a leading 1 bit land in bucket 0 relative to a zero
        // own ID, so the bucket fills after REPLICATION_PARAM inserts.
        let mut first = None;
        for i in 0..REPLICATION_PARAM {
            let mut id = [0u8; 20];
            id[0] = 0x80;
            id[19] = i as u8 + 1;
            let c = contact(Key::new(id), 1000 + i as u16);
            if first.is_none() {
                first = Some(c.clone());
            }
            assert!(table.add_contact(c).is_none());
        }
        assert_eq!(table.bucket_len(0), REPLICATION_PARAM);

        let mut id = [0u8; 20];
        id[0] = 0x80;
        id[19] = 0xFF;
        let newcomer = contact(Key::new(id), 2000);
        let candidate = table.add_contact(newcomer.clone()).expect("bucket should be full");
        // Oldest first-inserted contact is the eviction candidate, and the
        // table is not mutated by the refusal.
        assert_eq!(candidate.id, first.unwrap().id);
        assert_eq!(table.bucket_len(0), REPLICATION_PARAM);

        // The caller decided the candidate was dead: remove, then retry.
        table.remove_contact(&candidate.id);
        assert!(table.add_contact(newcomer.clone()).is_none());
        assert_eq!(table.bucket_len(0), REPLICATION_PARAM);
        let held = table.find_closest(&newcomer.id, REPLICATION_PARAM);
        assert!(held.iter().any(|c| c.id == newcomer.id));
        assert!(!held.iter().any(|c| c.id == candidate.id));
    }

    #[test]
    fn test_readd_moves_to_front() {
        let me = contact(Key::new([0u8; 20]), 1);
        let mut table = RoutingTable::new(me);

        let mut contacts = Vec::new();
        for i in 0..REPLICATION_PARAM {
            let mut id = [0u8; 20];
            id[0] = 0x80;
            id[19] = i as u8 + 1;
            let c = contact(Key::new(id), 1000 + i as u16);
            contacts.push(c.clone());
            table.add_contact(c);
        }

        // Touch the oldest entry; the eviction candidate must change.
        table.add_contact(contacts[0].clone());
        let newcomer = contact(Key::new([0x80; 20]), 2000);
        let candidate = table.add_contact(newcomer).expect("bucket should be full");
        assert_eq!(candidate.id, contacts[1].id);
    }

    #[test]
    fn test_bucket_index_matches_stored_position() {
        let me = Key::random();
        let mut table = RoutingTable::new(contact(me, 1));
        for i in 0..200 {
            table.add_contact(contact(Key::random(), 1000 + i));
        }
        for (index, bucket) in table.buckets.iter().enumerate() {
            assert!(bucket.len() <= REPLICATION_PARAM);
            for stored in &bucket.contacts {
                assert_eq!(stored.id.xor(&me).leading_zeros(), index);
                assert_eq!(bucket_index(&me, &stored.id), index);
            }
        }
    }

    #[test]
    fn test_find_closest_is_sorted_and_bounded() {
        let me = contact(Key::random(), 1);
        let mut table = RoutingTable::new(me);
        for i in 0..100 {
            table.add_contact(contact(Key::random(), 1000 + i));
        }

        let target = Key::random();
        for count in [1, 7, REPLICATION_PARAM, 1000] {
            let closest = table.find_closest(&target, count);
            assert!(closest.len() <= count);
            for pair in closest.windows(2) {
                assert!(pair[0].distance <= pair[1].distance);
            }
            for found in &closest {
                assert_eq!(found.distance, Some(found.id.xor(&target)));
            }
        }
    }

    #[test]
    fn test_find_closest_returns_true_closest() {
        let me = contact(Key::random(), 1);
        let mut table = RoutingTable::new(me);
        let mut all = Vec::new();
        for i in 0..50 {
            let c = contact(Key::random(), 1000 + i);
            all.push(c.clone());
            table.add_contact(c);
        }

        let target = Key::random();
        all.sort_by_key(|c| c.id.xor(&target));
        let expected: Vec<_> = all.iter().take(5).map(|c| c.id).collect();
        let got: Vec<_> = table.find_closest(&target, 5).into_iter().map(|c| c.id).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_zero_distance_maps_to_last_bucket() {
        let me = Key::random();
        assert_eq!(bucket_index(&me, &me), ROUTING_TABLE_SIZE - 1);
    }
}
