/// the cache tiers in front of the entry collection.
///
/// Think of it as a level 1 / level 2 application cache similar to CPUs: level 1 is the
/// in-process memory tier, closest to the app and the fastest. Level 2 is the distributed
/// tier shared across processes, e.g., hosted redis. Behind both sits the entry collection,
/// which resolves from the providers on a miss.
///
pub mod distributed;
pub mod tiered;
pub mod worker;
