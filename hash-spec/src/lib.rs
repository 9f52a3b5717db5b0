use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use argon2::Params;
use blake2::{
    digest::{self, Digest, VariableOutput},
    Blake2b512, Blake2bVar,
};

pub const ARGON2_BLOCK_SIZE: usize = 1024;
pub const ARGON2_BLOCK_WORDS: usize = ARGON2_BLOCK_SIZE / 8;
pub const ARGON2_SYNC_POINTS: u32 = 4;
pub const MIN_SALT_LEN: usize = 8;

/// Argon2 function family. `as_u32` yields the RFC 9106 type number, which
/// the kernel preprocessor defines reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argon2Kind {
    Argon2d,
    Argon2i,
    Argon2id,
}

impl Argon2Kind {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Argon2d => 0,
            Self::Argon2i => 1,
            Self::Argon2id => 2,
        }
    }

    /// True for the variants that address at least part of their memory
    /// independently of the data (argon2i everywhere, argon2id in the first
    /// two slices of the first pass).
    pub fn uses_data_independent_addressing(self) -> bool {
        matches!(self, Self::Argon2i | Self::Argon2id)
    }
}

impl FromStr for Argon2Kind {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self> {
        match text.to_ascii_lowercase().as_str() {
            "argon2d" | "d" => Ok(Self::Argon2d),
            "argon2i" | "i" => Ok(Self::Argon2i),
            "argon2id" | "id" => Ok(Self::Argon2id),
            _ => bail!("unknown Argon2 kind '{text}' (expected argon2d, argon2i or argon2id)"),
        }
    }
}

impl fmt::Display for Argon2Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Argon2d => "argon2d",
            Self::Argon2i => "argon2i",
            Self::Argon2id => "argon2id",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argon2Version {
    V0x10,
    V0x13,
}

impl Argon2Version {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::V0x10 => 0x10,
            Self::V0x13 => 0x13,
        }
    }
}

impl FromStr for Argon2Version {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self> {
        match text.trim() {
            "16" | "0x10" | "1.0" => Ok(Self::V0x10),
            "19" | "0x13" | "1.3" => Ok(Self::V0x13),
            _ => bail!("unknown Argon2 version '{text}' (expected 16 or 19)"),
        }
    }
}

impl fmt::Display for Argon2Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Which Argon2 function a processing unit computes. Fixed for the lifetime
/// of the compiled kernel; cost parameters live in [`HashParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramContext {
    pub kind: Argon2Kind,
    pub version: Argon2Version,
}

/// Validated Argon2 cost parameters plus the salt, with the derived block
/// geometry (total, per-lane and per-segment block counts) exposed to the
/// kernel side.
///
/// The host half of the algorithm lives here as well: H0 expansion into the
/// first two blocks of every lane, and the final XOR-and-hash step over the
/// last block of every lane. The memory-filling middle belongs to a kernel
/// runner.
#[derive(Debug, Clone)]
pub struct HashParams {
    params: Params,
    salt: Vec<u8>,
    output_len: usize,
}

impl HashParams {
    pub fn new(
        output_len: usize,
        salt: &[u8],
        time_cost: u32,
        memory_kib: u32,
        lanes: u32,
    ) -> Result<Self> {
        if salt.len() < MIN_SALT_LEN {
            bail!(
                "salt must be at least {MIN_SALT_LEN} bytes, got {}",
                salt.len()
            );
        }
        if u32::try_from(salt.len()).is_err() {
            bail!("salt length overflows the Argon2 preamble");
        }
        if u32::try_from(output_len).is_err() {
            bail!("output length overflows the Argon2 preamble");
        }

        let params = Params::new(memory_kib, time_cost, lanes, Some(output_len)).map_err(|err| {
            anyhow!(
                "invalid Argon2 parameters (m={memory_kib} KiB, t={time_cost}, lanes={lanes}, out={output_len}): {err}"
            )
        })?;

        Ok(Self {
            params,
            salt: salt.to_vec(),
            output_len,
        })
    }

    pub fn lanes(&self) -> u32 {
        self.params.p_cost()
    }

    pub fn time_cost(&self) -> u32 {
        self.params.t_cost()
    }

    pub fn memory_kib(&self) -> u32 {
        self.params.m_cost()
    }

    /// Total block count, rounded down to a multiple of four blocks per lane
    /// as Argon2 defines the rounding.
    pub fn memory_blocks(&self) -> usize {
        self.params.block_count()
    }

    pub fn lane_blocks(&self) -> usize {
        self.memory_blocks() / self.lanes() as usize
    }

    pub fn segment_blocks(&self) -> usize {
        self.lane_blocks() / ARGON2_SYNC_POINTS as usize
    }

    pub fn output_len(&self) -> usize {
        self.output_len
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Computes H0 for `password` and expands it into the first two blocks of
    /// every lane, writing `lanes * 2 * 128` little-endian words. This is the
    /// staging content a kernel runner expects in each job's input region.
    pub fn fill_first_blocks(
        &self,
        context: ProgramContext,
        password: &[u8],
        out_words: &mut [u64],
    ) -> Result<()> {
        let lanes = self.lanes() as usize;
        let needed = lanes * 2 * ARGON2_BLOCK_WORDS;
        if out_words.len() < needed {
            bail!(
                "seed output buffer too small: expected at least {needed} words, got {}",
                out_words.len()
            );
        }

        let pw_len = u32::try_from(password.len())
            .map_err(|_| anyhow!("password length overflows the Argon2 preamble"))?;

        let mut initial = Blake2b512::new();
        initial.update(self.params.p_cost().to_le_bytes());
        initial.update((self.output_len as u32).to_le_bytes());
        initial.update(self.params.m_cost().to_le_bytes());
        initial.update(self.params.t_cost().to_le_bytes());
        initial.update(context.version.as_u32().to_le_bytes());
        initial.update(context.kind.as_u32().to_le_bytes());
        initial.update(pw_len.to_le_bytes());
        initial.update(password);
        initial.update((self.salt.len() as u32).to_le_bytes());
        initial.update(&self.salt);
        initial.update(0u32.to_le_bytes());
        initial.update(0u32.to_le_bytes());
        let h0 = initial.finalize();

        for lane in 0..lanes {
            let lane_index = (lane as u32).to_le_bytes();
            let lane_words = &mut out_words[lane * 2 * ARGON2_BLOCK_WORDS..][..2 * ARGON2_BLOCK_WORDS];
            for (block_idx, words_chunk) in
                lane_words.chunks_exact_mut(ARGON2_BLOCK_WORDS).enumerate()
            {
                let block_index = (block_idx as u32).to_le_bytes();
                let mut block_bytes = [0u8; ARGON2_BLOCK_SIZE];
                blake2b_long(&[h0.as_ref(), &block_index, &lane_index], &mut block_bytes)?;

                for (chunk, dst) in block_bytes.chunks_exact(8).zip(words_chunk.iter_mut()) {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(chunk);
                    *dst = u64::from_le_bytes(bytes);
                }
            }
        }

        Ok(())
    }

    /// XORs the final block of every lane (`lanes * 128` words in
    /// `last_block_words`) and hashes the result down to the configured
    /// output length.
    pub fn finalize(&self, last_block_words: &[u64], out: &mut [u8]) -> Result<()> {
        let lanes = self.lanes() as usize;
        let needed = lanes * ARGON2_BLOCK_WORDS;
        if last_block_words.len() < needed {
            bail!(
                "last block buffer too small: expected at least {needed} words, got {}",
                last_block_words.len()
            );
        }
        if out.len() != self.output_len {
            bail!(
                "hash buffer length {} does not match configured output length {}",
                out.len(),
                self.output_len
            );
        }

        let mut xored = [0u64; ARGON2_BLOCK_WORDS];
        for lane in 0..lanes {
            let lane_words = &last_block_words[lane * ARGON2_BLOCK_WORDS..][..ARGON2_BLOCK_WORDS];
            for (acc, word) in xored.iter_mut().zip(lane_words) {
                *acc ^= word;
            }
        }

        let mut block_bytes = [0u8; ARGON2_BLOCK_SIZE];
        for (dst, word) in block_bytes.chunks_exact_mut(8).zip(xored.iter()) {
            dst.copy_from_slice(&word.to_le_bytes());
        }

        blake2b_long(&[&block_bytes], out)
    }
}

/// Argon2's variable-length hash H': plain variable Blake2b up to 64 bytes,
/// chained half-overlapping Blake2b blocks above that.
pub fn blake2b_long(inputs: &[&[u8]], out: &mut [u8]) -> Result<()> {
    if out.is_empty() {
        bail!("blake2b_long output buffer is empty");
    }

    let len_bytes = u32::try_from(out.len())
        .map(|v| v.to_le_bytes())
        .map_err(|_| anyhow!("blake2b_long output length overflow"))?;

    if out.len() <= Blake2b512::output_size() {
        let mut hasher = Blake2bVar::new(out.len())
            .map_err(|_| anyhow!("invalid variable Blake2b output length"))?;

        digest::Update::update(&mut hasher, &len_bytes);
        for input in inputs {
            digest::Update::update(&mut hasher, input);
        }

        hasher
            .finalize_variable(out)
            .map_err(|_| anyhow!("failed to finalize Blake2b variable output"))?;
        return Ok(());
    }

    let half_hash_len = Blake2b512::output_size() / 2;
    let mut hasher = Blake2b512::new();
    hasher.update(len_bytes);
    for input in inputs {
        hasher.update(input);
    }

    let mut last_output = hasher.finalize();
    out[..half_hash_len].copy_from_slice(&last_output[..half_hash_len]);

    let mut counter = half_hash_len;
    while out.len().saturating_sub(counter) > Blake2b512::output_size() {
        last_output = Blake2b512::digest(last_output);
        let end = counter + half_hash_len;
        out[counter..end].copy_from_slice(&last_output[..half_hash_len]);
        counter = end;
    }

    let tail_len = out.len().saturating_sub(counter);
    let mut tail = Blake2bVar::new(tail_len)
        .map_err(|_| anyhow!("invalid final Blake2b output length"))?;
    digest::Update::update(&mut tail, &last_output);
    tail.finalize_variable(&mut out[counter..])
        .map_err(|_| anyhow!("failed to finalize tail Blake2b output"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONTEXT: ProgramContext = ProgramContext {
        kind: Argon2Kind::Argon2id,
        version: Argon2Version::V0x13,
    };

    fn test_params(lanes: u32) -> HashParams {
        HashParams::new(32, b"somesalt", 1, 8 * lanes.max(2), lanes)
            .expect("test parameters should validate")
    }

    #[test]
    fn kind_parses_cli_names() {
        assert_eq!(
            "argon2id".parse::<Argon2Kind>().expect("argon2id should parse"),
            Argon2Kind::Argon2id
        );
        assert_eq!(
            "D".parse::<Argon2Kind>().expect("short form should parse"),
            Argon2Kind::Argon2d
        );
        assert!("argon3".parse::<Argon2Kind>().is_err());
        assert_eq!(Argon2Kind::Argon2i.as_u32(), 1);
        assert!(!Argon2Kind::Argon2d.uses_data_independent_addressing());
        assert!(Argon2Kind::Argon2id.uses_data_independent_addressing());
    }

    #[test]
    fn version_parses_decimal_and_hex_forms() {
        assert_eq!(
            "19".parse::<Argon2Version>().expect("19 should parse"),
            Argon2Version::V0x13
        );
        assert_eq!(
            "0x10".parse::<Argon2Version>().expect("0x10 should parse"),
            Argon2Version::V0x10
        );
        assert!("17".parse::<Argon2Version>().is_err());
        assert_eq!(Argon2Version::V0x13.as_u32(), 0x13);
    }

    #[test]
    fn params_reject_short_salt() {
        let err = HashParams::new(32, b"salt", 1, 64, 1).expect_err("short salt should fail");
        assert!(format!("{err:#}").contains("salt"));
    }

    #[test]
    fn params_round_memory_down_to_lane_multiple() {
        let params = HashParams::new(32, b"somesalt", 2, 19, 2)
            .expect("parameters should validate");
        assert_eq!(params.memory_blocks(), 16);
        assert_eq!(params.lane_blocks(), 8);
        assert_eq!(params.segment_blocks(), 2);
        assert_eq!(params.lanes(), 2);
        assert_eq!(params.time_cost(), 2);
    }

    #[test]
    fn fill_first_blocks_is_deterministic_and_input_sensitive() {
        let params = test_params(2);
        let words = 2 * 2 * ARGON2_BLOCK_WORDS;

        let mut first = vec![0u64; words];
        params
            .fill_first_blocks(TEST_CONTEXT, b"password", &mut first)
            .expect("fill should succeed");

        let mut again = vec![0u64; words];
        params
            .fill_first_blocks(TEST_CONTEXT, b"password", &mut again)
            .expect("repeat fill should succeed");
        assert_eq!(first, again);

        let mut other_pw = vec![0u64; words];
        params
            .fill_first_blocks(TEST_CONTEXT, b"passwore", &mut other_pw)
            .expect("fill with different password should succeed");
        assert_ne!(first, other_pw);

        let other_kind = ProgramContext {
            kind: Argon2Kind::Argon2d,
            version: Argon2Version::V0x13,
        };
        let mut other_kind_words = vec![0u64; words];
        params
            .fill_first_blocks(other_kind, b"password", &mut other_kind_words)
            .expect("fill with different kind should succeed");
        assert_ne!(first, other_kind_words);

        let other_version = ProgramContext {
            kind: Argon2Kind::Argon2id,
            version: Argon2Version::V0x10,
        };
        let mut other_version_words = vec![0u64; words];
        params
            .fill_first_blocks(other_version, b"password", &mut other_version_words)
            .expect("fill with different version should succeed");
        assert_ne!(first, other_version_words);
    }

    #[test]
    fn fill_first_blocks_distinguishes_lanes_and_blocks() {
        let params = test_params(2);
        let mut words = vec![0u64; 2 * 2 * ARGON2_BLOCK_WORDS];
        params
            .fill_first_blocks(TEST_CONTEXT, b"", &mut words)
            .expect("empty password fill should succeed");

        let lane0_block0 = &words[..ARGON2_BLOCK_WORDS];
        let lane0_block1 = &words[ARGON2_BLOCK_WORDS..2 * ARGON2_BLOCK_WORDS];
        let lane1_block0 = &words[2 * ARGON2_BLOCK_WORDS..3 * ARGON2_BLOCK_WORDS];

        assert_ne!(lane0_block0, lane0_block1);
        assert_ne!(lane0_block0, lane1_block0);
        assert!(lane0_block0.iter().any(|&w| w != 0));
    }

    #[test]
    fn fill_first_blocks_rejects_short_buffer() {
        let params = test_params(2);
        let mut words = vec![0u64; ARGON2_BLOCK_WORDS];
        let err = params
            .fill_first_blocks(TEST_CONTEXT, b"pw", &mut words)
            .expect_err("short buffer should fail");
        assert!(format!("{err:#}").contains("too small"));
    }

    #[test]
    fn finalize_xors_lane_last_blocks() {
        let two_lane = test_params(2);
        let one_lane = test_params(1);

        let pattern: Vec<u64> = (0..ARGON2_BLOCK_WORDS as u64)
            .map(|i| i.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .collect();

        // Identical last blocks in both lanes cancel to the zero block.
        let mut both_lanes = pattern.clone();
        both_lanes.extend_from_slice(&pattern);
        let mut two_lane_hash = [0u8; 32];
        two_lane
            .finalize(&both_lanes, &mut two_lane_hash)
            .expect("two-lane finalize should succeed");

        let zero_block = vec![0u64; ARGON2_BLOCK_WORDS];
        let mut zero_hash = [0u8; 32];
        one_lane
            .finalize(&zero_block, &mut zero_hash)
            .expect("single-lane finalize should succeed");

        assert_eq!(two_lane_hash, zero_hash);
    }

    #[test]
    fn finalize_validates_buffer_lengths() {
        let params = test_params(1);
        let block = vec![0u64; ARGON2_BLOCK_WORDS];

        let mut short_hash = [0u8; 16];
        let err = params
            .finalize(&block, &mut short_hash)
            .expect_err("wrong hash length should fail");
        assert!(format!("{err:#}").contains("output length"));

        let mut hash = [0u8; 32];
        let err = params
            .finalize(&block[..64], &mut hash)
            .expect_err("short block buffer should fail");
        assert!(format!("{err:#}").contains("too small"));
    }

    #[test]
    fn blake2b_long_matches_expected_len_behavior() {
        let mut short = [0u8; 32];
        blake2b_long(&[b"argon2"], &mut short).expect("short output should hash");

        let mut long = [0u8; 96];
        blake2b_long(&[b"argon2"], &mut long).expect("long output should hash");

        assert_ne!(short, [0u8; 32]);
        assert_ne!(long, [0u8; 96]);
        assert_ne!(&long[..32], &short);
    }
}
