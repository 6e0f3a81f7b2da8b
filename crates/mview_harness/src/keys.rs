//! Shared randomness for record codes, record ids and group keys.
//!
//! One seeded generator serves every task for group keys, so a seed replays
//! the same key sequence. Codes are built from the current Unix second plus
//! 10 bytes from the thread-local OS-seeded generator, never the seeded one:
//! two runs sharing a seed must not write each other's rows.

use std::sync::Mutex;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use uuid::Uuid;

/// Random bytes mixed into every code.
pub const CODE_RANDOM_BYTES: usize = 10;
/// Prefix of generated group keys.
pub const GROUP_KEY_PREFIX: &str = "user";

#[derive(Debug)]
pub struct KeyGenerator {
    seed: u64,
    rng: Mutex<StdRng>,
}

impl KeyGenerator {
    /// Create a generator; `seed == 0` picks a random seed.
    pub fn new(seed: u64) -> Self {
        let seed = if seed == 0 {
            rand::thread_rng().gen()
        } else {
            seed
        };
        Self {
            seed,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Effective seed, for reproducing a run.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Fresh record code: hex of `"{unix_secs}{hex(random)}"`.
    pub fn next_code(&self) -> String {
        let mut buf = [0u8; CODE_RANDOM_BYTES];
        rand::thread_rng().fill_bytes(&mut buf);
        encode_code(Utc::now().timestamp(), &buf)
    }

    /// Random group key `user<n>` with `n` in `0..space`.
    pub fn next_group_key(&self, space: u32) -> String {
        let n = self.with_rng(|rng| rng.gen_range(0..space.max(1)));
        group_key(n)
    }

    /// Time-ordered record id.
    pub fn next_record_id(&self) -> Uuid {
        Uuid::now_v7()
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }
}

/// Group key for a numeric index.
pub fn group_key(n: u32) -> String {
    format!("{GROUP_KEY_PREFIX}{n}")
}

fn encode_code(unix_secs: i64, random: &[u8]) -> String {
    let inner = format!("{unix_secs}{}", hex::encode(random));
    hex::encode(inner.as_bytes())
}
