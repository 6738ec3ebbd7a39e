//! Deterministic random number generation.
//!
//! Every Monte Carlo run derives its stream from a string seed of the form
//! `"{scenario_seed}-{run_index}"`. The string is hashed with an xmur3-style
//! mixer (over UTF-16 code units, so the same text always gives the same
//! state) and the resulting 32-bit value seeds a mulberry32 generator.
//! Nothing here touches platform entropy.

use rand::RngCore;

/// mulberry32 generator seeded from a string hash
#[derive(Debug, Clone)]
pub struct SeedRng {
    state: u32,
}

impl SeedRng {
    pub fn from_seed_str(seed: &str) -> Self {
        Self {
            state: hash_seed(seed),
        }
    }

    /// Stream for one Monte Carlo run of a scenario
    pub fn for_run(seed: &str, run_index: u32) -> Self {
        Self::from_seed_str(&format!("{}-{}", seed, run_index))
    }

    fn step(&mut self) -> u32 {
        self.state = self.state.wrapping_add(0x6D2B_79F5);
        let a = self.state;
        let mut t = (a ^ (a >> 15)).wrapping_mul(1 | a);
        t = t.wrapping_add((t ^ (t >> 7)).wrapping_mul(61 | t)) ^ t;
        t ^ (t >> 14)
    }

    /// Uniform float in [0, 1)
    pub fn next_f64(&mut self) -> f64 {
        self.step() as f64 / 4_294_967_296.0
    }
}

impl RngCore for SeedRng {
    fn next_u32(&mut self) -> u32 {
        self.step()
    }

    fn next_u64(&mut self) -> u64 {
        let hi = self.step() as u64;
        let lo = self.step() as u64;
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let bytes = self.step().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// xmur3 string hash, first output of the avalanche finaliser
fn hash_seed(seed: &str) -> u32 {
    let len = seed.encode_utf16().count() as u32;
    let mut h: u32 = 1_779_033_703 ^ len;
    for unit in seed.encode_utf16() {
        h = (h ^ unit as u32).wrapping_mul(3_432_918_353);
        h = h.rotate_left(13);
    }
    h = (h ^ (h >> 16)).wrapping_mul(2_246_822_507);
    h = (h ^ (h >> 13)).wrapping_mul(3_266_489_909);
    h ^ (h >> 16)
}
