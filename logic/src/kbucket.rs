use std::time::{Duration, Instant};

use crate::{contact::Contact, Id};

/// One prefix bucket: at most `k` contacts ordered least-recently-seen
/// first (tail is freshest), plus a single parked replacement candidate
/// waiting for the outcome of a head probe.
#[derive(Clone, Debug)]
pub struct KBucket {
    pub entries: Vec<Contact>,
    pub replacement: Option<Contact>,
    pub last_activity: Instant,
}

impl Default for KBucket {
    fn default() -> Self {
        KBucket {
            entries: Vec::new(),
            replacement: None,
            last_activity: Instant::now(),
        }
    }
}

impl KBucket {
    pub fn has(&self, id: Id) -> bool {
        self.entries.iter().any(|x| x.id == id)
    }

    pub fn head(&self) -> Option<&Contact> {
        self.entries.first()
    }

    /// Moves the entry with `id` to the tail and stamps it, returns false
    /// if absent.
    pub fn refresh_node(&mut self, id: Id) -> bool {
        let entry = self.entries.iter_mut().enumerate().find(|(_, x)| x.id == id);

        match entry {
            Some((index, entry)) => {
                entry.touch();
                // Bring element at index to the back
                self.entries[index..].rotate_left(1);
                self.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: Id) -> bool {
        let i = self.entries.iter().position(|x| x.id == id);
        let removed = match i {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => {
                if self.replacement.as_ref().map_or(false, |x| x.id == id) {
                    self.replacement = None;
                }
                return false;
            }
        };
        // Promote the parked candidate into the freed slot; the bucket
        // just gained a live member, so it saw traffic
        if let Some(candidate) = self.replacement.take() {
            self.entries.push(candidate);
            self.last_activity = Instant::now();
        }
        removed
    }

    pub fn is_stale(&self, interval: Duration) -> bool {
        self.last_activity.elapsed() >= interval
    }
}
