// src/pow.rs

use anyhow::Result;
use blake3::Hasher as Blake3State;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

const BLOCK_HASH_DOMAIN: &[u8; 32] = b"BlockHash\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";

/// One gigahash, for hashrate reporting.
const BIG_GIG: f64 = 1_000_000_000.0;

pub type BlockHash = [u8; 32];

/// Raw block header as delivered by the template feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHeader {
    pub version: u32,
    pub parents_by_level: Vec<Vec<String>>,
    pub hash_merkle_root: String,
    pub accepted_id_merkle_root: String,
    pub utxo_commitment: String,
    pub timestamp: u64,
    pub bits: u32,
    pub nonce: u64,
    pub daa_score: u64,
    pub blue_work: String,
    pub blue_score: u64,
    pub pruning_point: String,
}

impl RawHeader {
    /// Full header hash, including timestamp and nonce.
    pub fn finalize_hash(&self) -> Result<BlockHash> {
        self.hash(false)
    }

    /// Hash with timestamp and nonce zeroed, the value miners grind on.
    pub fn pre_pow_hash(&self) -> Result<BlockHash> {
        self.hash(true)
    }

    pub fn network_target(&self) -> U256 {
        u256_from_compact_target(self.bits)
    }

    fn hash(&self, pre_pow: bool) -> Result<BlockHash> {
        let mut state = Blake3State::new_keyed(BLOCK_HASH_DOMAIN);

        let version = self.version as u16;
        state.update(&version.to_le_bytes());
        state.update(&(self.parents_by_level.len() as u64).to_le_bytes());

        let mut hash = [0u8; 32];
        for level in &self.parents_by_level {
            state.update(&(level.len() as u64).to_le_bytes());
            for h in level {
                hex::decode_to_slice(h, &mut hash)?;
                state.update(&hash);
            }
        }
        hex::decode_to_slice(&self.hash_merkle_root, &mut hash)?;
        state.update(&hash);
        hex::decode_to_slice(&self.accepted_id_merkle_root, &mut hash)?;
        state.update(&hash);
        hex::decode_to_slice(&self.utxo_commitment, &mut hash)?;
        state.update(&hash);

        let (timestamp, nonce) = if pre_pow { (0, 0) } else { (self.timestamp, self.nonce) };

        state
            .update(&timestamp.to_le_bytes())
            .update(&self.bits.to_le_bytes())
            .update(&nonce.to_le_bytes())
            .update(&self.daa_score.to_le_bytes())
            .update(&self.blue_score.to_le_bytes());

        // blue_work is a variable-length big-endian hex integer, possibly odd-length
        let len = (self.blue_work.len() + 1) / 2;
        if self.blue_work.len() % 2 == 0 {
            hex::decode_to_slice(&self.blue_work, &mut hash[..len])?;
        } else {
            hex::decode_to_slice(format!("0{}", self.blue_work), &mut hash[..len])?;
        }
        state.update(&(len as u64).to_le_bytes()).update(&hash[..len]);

        hex::decode_to_slice(&self.pruning_point, &mut hash)?;
        state.update(&hash);

        Ok(*state.finalize().as_bytes())
    }
}

/// Verification state for one cached template.
#[derive(Debug, Clone)]
pub struct Pow {
    header: RawHeader,
    network_target: U256,
}

impl Pow {
    pub fn new(header: &RawHeader) -> Result<Self> {
        // fail early on undecodable hex fields rather than on first submit
        header.pre_pow_hash()?;
        Ok(Pow {
            network_target: header.network_target(),
            header: header.clone(),
        })
    }

    /// Hashes the header with `nonce` stamped in. Returns whether the result
    /// meets the network target, and the PoW value itself for the pool-side
    /// difficulty check (lower is better).
    pub fn check_work(&self, nonce: u64) -> (bool, U256) {
        let mut header = self.header.clone();
        header.nonce = nonce;
        let value = match header.finalize_hash() {
            Ok(h) => U256::from_little_endian(&h),
            Err(_) => U256::MAX,
        };
        (value <= self.network_target, value)
    }
}

pub fn u256_from_compact_target(bits: u32) -> U256 {
    let (mant, expt) = {
        let unshifted_expt = bits >> 24;
        if unshifted_expt <= 3 {
            ((bits & 0xFFFFFF) >> (8 * (3 - unshifted_expt as usize)), 0)
        } else {
            (bits & 0xFFFFFF, 8 * ((bits >> 24) - 3))
        }
    };

    // The mantissa is signed but may not be negative
    if mant > 0x7FFFFF {
        U256::zero()
    } else {
        U256::from(mant as u64) << (expt as usize)
    }
}

/// Pool-side share target for a worker difficulty.
pub fn calculate_target(difficulty: u64) -> U256 {
    if difficulty == 0 {
        return U256::MAX;
    }
    U256::MAX / U256::from(difficulty)
}

/// Hashes represented by one share at `difficulty`, in gigahashes.
/// hash(d) = d * (2^256 / 2^224) / 1e9 = d * 2^32 / 1e9
pub fn diff_to_hash(difficulty: f64) -> f64 {
    difficulty * 2f64.powi(32) / BIG_GIG
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn test_header(daa_score: u64, timestamp: u64) -> RawHeader {
        let zeros = "0".repeat(64);
        RawHeader {
            version: 1,
            parents_by_level: vec![vec![zeros.clone()]],
            hash_merkle_root: zeros.clone(),
            accepted_id_merkle_root: zeros.clone(),
            utxo_commitment: zeros.clone(),
            timestamp,
            bits: 0x207fffff,
            nonce: 0,
            daa_score,
            blue_work: "1234af".into(),
            blue_score: daa_score,
            pruning_point: zeros,
        }
    }

    #[test]
    fn compact_target_expands() {
        // Bitcoin difficulty-1 bits: 0x1d00ffff -> 0xffff << 208
        let target = u256_from_compact_target(0x1d00ffff);
        assert_eq!(target, U256::from(0xffffu64) << 208usize);

        // small exponent shifts the mantissa down instead
        let target = u256_from_compact_target(0x01100000);
        assert_eq!(target, U256::from(0x10u64));

        // negative mantissa is invalid
        assert_eq!(u256_from_compact_target(0x1dffffff), U256::zero());
    }

    #[test]
    fn share_target_scales_inversely() {
        assert_eq!(calculate_target(0), U256::MAX);
        assert_eq!(calculate_target(1), U256::MAX);
        assert_eq!(calculate_target(4), U256::MAX / U256::from(4u64));
        assert!(calculate_target(1 << 20) < calculate_target(1 << 10));
    }

    #[test]
    fn diff_to_hash_is_linear_in_difficulty() {
        assert_eq!(diff_to_hash(0.0), 0.0);
        let one = diff_to_hash(1.0);
        assert!((one - 4.294967296).abs() < 1e-9);
        assert!((diff_to_hash(64.0) - 64.0 * one).abs() < 1e-6);
    }

    #[test]
    fn check_work_accepts_everything_at_difficulty_one() {
        let pow = Pow::new(&test_header(100, 1_700_000_000_000)).unwrap();
        let (_, value) = pow.check_work(42);
        assert!(value <= calculate_target(1));
    }

    #[test]
    fn pre_pow_hash_ignores_timestamp_and_nonce() {
        let mut header = test_header(5, 1000);
        let pre = header.pre_pow_hash().unwrap();
        header.timestamp = 9999;
        header.nonce = 77;
        assert_eq!(pre, header.pre_pow_hash().unwrap());
        assert_ne!(pre, header.finalize_hash().unwrap());
    }

    #[test]
    fn nonce_changes_final_hash() {
        let header = test_header(5, 1000);
        let pow = Pow::new(&header).unwrap();
        let (_, a) = pow.check_work(1);
        let (_, b) = pow.check_work(2);
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_malformed_hex_fields() {
        let mut header = test_header(1, 1);
        header.hash_merkle_root = "zz".repeat(32);
        assert!(Pow::new(&header).is_err());
    }
}
