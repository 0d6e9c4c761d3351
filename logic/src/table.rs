use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::{
    config::RoutingConfig,
    consts::ID_LEN_BITS,
    contact::Contact,
    id::{cmp_by_distance, common_prefix_len},
    kbucket::KBucket,
    Id,
};

/// Outcome of [`RoutingTable::observe`]. `ProbeHead` asks the caller to
/// PING the returned head contact and report back through
/// [`RoutingTable::head_alive`] / [`RoutingTable::head_dead`]; until it
/// does, the observed contact waits in the bucket's replacement slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observed {
    /// The local node's own id, never stored
    Ignored,
    /// Already present, LRU position freshened
    Refreshed,
    Inserted,
    ProbeHead(Contact),
    /// Bucket full and a candidate is already parked
    Discarded,
}

/// Prefix-bucketed view of the overlay: bucket `i` holds contacts whose
/// id shares the first `i` bits with the local id. Owned by exactly one
/// node; callers serialize access behind a lock.
pub struct RoutingTable {
    id: Id,
    config: RoutingConfig,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(id: Id, config: RoutingConfig) -> Self {
        RoutingTable {
            id,
            config,
            buckets: (0..ID_LEN_BITS).map(|_| KBucket::default()).collect(),
        }
    }

    pub fn local_id(&self) -> Id {
        self.id
    }

    fn bucket_index(&self, id: Id) -> usize {
        // An id equal to ours would land at 160, clamp it into the last
        // bucket so lookups for our own id still have a starting point
        (common_prefix_len(self.id, id) as usize).min(ID_LEN_BITS - 1)
    }

    /// Records evidence that `contact` is alive.
    pub fn observe(&mut self, contact: Contact) -> Observed {
        if contact.id == self.id {
            return Observed::Ignored;
        }
        let index = self.bucket_index(contact.id);
        let bucket = &mut self.buckets[index];

        if bucket.refresh_node(contact.id) {
            return Observed::Refreshed;
        }
        if bucket.entries.len() < self.config.bucket_size {
            bucket.entries.push(contact);
            bucket.last_activity = Instant::now();
            return Observed::Inserted;
        }
        if bucket.replacement.is_some() {
            debug!("Bucket {index} full and probing, discarding {contact:?}");
            return Observed::Discarded;
        }
        let head = bucket.head().cloned().expect("full bucket has a head");
        bucket.replacement = Some(contact);
        Observed::ProbeHead(head)
    }

    /// The probed head answered: it keeps its seat (moved to the tail)
    /// and the parked candidate is discarded.
    pub fn head_alive(&mut self, id: Id) {
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];
        bucket.refresh_node(id);
        bucket.replacement = None;
    }

    /// The probed head timed out: evict it and seat the candidate.
    pub fn head_dead(&mut self, id: Id) {
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];
        debug!("Evicting silent head {id:?} from bucket {index}");
        // remove() promotes the replacement into the freed slot
        bucket.remove(id);
    }

    pub fn remove(&mut self, id: Id) -> bool {
        let index = self.bucket_index(id);
        self.buckets[index].remove(id)
    }

    pub fn contains(&self, id: Id) -> bool {
        self.buckets[self.bucket_index(id)].has(id)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `count` contacts sorted ascending by XOR distance to
    /// `target`. Starts at the target's bucket and walks outward until
    /// enough contacts are collected; the final sort makes the
    /// traversal order irrelevant.
    pub fn closest(&self, target: Id, count: usize) -> Vec<Contact> {
        let index = self.bucket_index(target);
        let mut found: Vec<Contact> = self.buckets[index].entries.clone();

        for d in 1..ID_LEN_BITS {
            if found.len() >= count {
                break;
            }
            let mut any = false;
            if index >= d {
                found.extend(self.buckets[index - d].entries.iter().cloned());
                any = true;
            }
            if index + d < ID_LEN_BITS {
                found.extend(self.buckets[index + d].entries.iter().cloned());
                any = true;
            }
            if !any {
                break;
            }
        }

        found.sort_unstable_by(|a, b| cmp_by_distance(a.id, b.id, target));
        found.truncate(count);
        found
    }

    pub fn snapshot_bucket(&self, index: usize) -> Vec<Contact> {
        self.buckets[index].entries.clone()
    }

    /// Indexes of buckets that saw no traffic for `interval`. Empty
    /// buckets with empty neighbourhoods are skipped, there is nothing
    /// to converge towards there.
    pub fn stale_buckets(&self, interval: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty() && b.is_stale(interval))
            .map(|(i, _)| i)
            .collect()
    }

    /// Bucket heads that have been silent past `window`, candidates for
    /// a liveness probe.
    pub fn idle_heads(&self, window: Duration) -> Vec<Contact> {
        self.buckets
            .iter()
            .filter_map(|b| b.head())
            .filter(|head| !head.is_alive(window))
            .cloned()
            .collect()
    }

    /// A random id falling into bucket `index`: shares the first `index`
    /// bits with the local id, differs at bit `index`, rest random.
    pub fn random_id_in_bucket<R: Rng>(&self, index: usize, rng: &mut R) -> Id {
        let mask = Id::create_left_mask(index as u32 + 1);
        ((self.id ^ Id::ZERO.set_bit(index as u32)) & mask) | (rng.gen::<Id>() & !mask)
    }
}
