use std::panic::{self, AssertUnwindSafe};
use std::thread;

use tracing::{error, info};

use crate::domain::{ShardStrategy, TaxonOid};

/// A statically assigned, ordered subset of work items processed by one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard<T> {
    pub index: usize,
    pub items: Vec<T>,
}

impl<T> Shard<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub trait ShardKey {
    fn shard_key(&self) -> &TaxonOid;
}

impl ShardKey for TaxonOid {
    fn shard_key(&self) -> &TaxonOid {
        self
    }
}

impl ShardKey for crate::domain::Identifier {
    fn shard_key(&self) -> &TaxonOid {
        &self.oid
    }
}

impl ShardKey for crate::downloader::DownloadTask {
    fn shard_key(&self) -> &TaxonOid {
        &self.oid
    }
}

/// Round-robin partition: the item at position `k` goes to shard `k mod n`.
/// Always returns `n` shards (at least one), some of which may be empty.
pub fn shard<T>(items: Vec<T>, n: usize) -> Vec<Shard<T>> {
    let n = n.max(1);
    let mut shards = (0..n)
        .map(|index| Shard {
            index,
            items: Vec::new(),
        })
        .collect::<Vec<_>>();
    for (position, item) in items.into_iter().enumerate() {
        shards[position % n].items.push(item);
    }
    shards
}

/// Partition by a stable hash of the primary id, so an identifier lands in the same
/// shard index regardless of the order or filtering of the input.
pub fn shard_by_key<T: ShardKey>(items: Vec<T>, n: usize) -> Vec<Shard<T>> {
    let n = n.max(1);
    let mut shards = (0..n)
        .map(|index| Shard {
            index,
            items: Vec::new(),
        })
        .collect::<Vec<_>>();
    for item in items {
        let slot = (fnv1a(item.shard_key().as_str().as_bytes()) % n as u64) as usize;
        shards[slot].items.push(item);
    }
    shards
}

pub fn partition<T: ShardKey>(items: Vec<T>, n: usize, strategy: ShardStrategy) -> Vec<Shard<T>> {
    match strategy {
        ShardStrategy::RoundRobin => shard(items, n),
        ShardStrategy::StableHash => shard_by_key(items, n),
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Runs every shard on its own thread, items in order, and returns once all shards
/// have finished. Returning is the stage barrier.
///
/// An item whose work panics is logged and contributes no outcome; the rest of its
/// shard and every sibling shard carry on.
pub fn run_sharded<T, R, F>(stage: &str, shards: Vec<Shard<T>>, work: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> R + Sync,
{
    let work = &work;
    thread::scope(|scope| {
        let handles = shards
            .into_iter()
            .map(|shard| {
                let index = shard.index;
                info!(stage, shard = index, items = shard.len(), "starting shard");
                let handle = scope.spawn(move || {
                    shard
                        .items
                        .into_iter()
                        .filter_map(|item| {
                            match panic::catch_unwind(AssertUnwindSafe(|| work(index, item))) {
                                Ok(result) => Some(result),
                                Err(_) => {
                                    error!(stage, shard = index, "work item panicked");
                                    None
                                }
                            }
                        })
                        .collect::<Vec<_>>()
                });
                (index, handle)
            })
            .collect::<Vec<_>>();

        let mut outcomes = Vec::new();
        for (index, handle) in handles {
            match handle.join() {
                Ok(results) => outcomes.extend(results),
                Err(_) => error!(stage, shard = index, "shard panicked"),
            }
        }
        outcomes
    })
}
