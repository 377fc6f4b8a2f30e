use rand::{Rng, RngCore};
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of randomness for values that must not be predictable by peers (initial outgoing
///  sequence numbers) or that only need to differ between process incarnations (address nonces).
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn next_u32() -> u32;
    fn gen_u64_range(range: Range<u64>) -> u64;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32() -> u32 {
        rand::thread_rng().next_u32()
    }

    fn gen_u64_range(range: Range<u64>) -> u64 {
        rand::thread_rng().gen_range(range)
    }
}
