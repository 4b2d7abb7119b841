//! Shared types for the sync pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IndexerError;
use crate::tip::ChainTip;

// ─── BlockHash ────────────────────────────────────────────────────────────────

/// A 32-byte block identifier, stored in display order (the order explorers
/// and `getblockhash` print it).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// The all-zero hash used as the parent of a genesis block.
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn from_hex(s: &str) -> Result<Self, IndexerError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| IndexerError::Configuration(format!("invalid block hash '{s}': {e}")))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            IndexerError::Configuration(format!("block hash must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl FromStr for BlockHash {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter that writes byte vectors as lowercase hex.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A raw block as delivered by a [`BlockSource`](crate::source::BlockSource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    /// Consensus-serialized block bytes.
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

impl Block {
    /// Returns `true` if this block directly extends `tip`.
    pub fn extends(&self, tip: &ChainTip) -> bool {
        self.height == tip.height + 1 && self.parent_hash == tip.hash
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }
}

// ─── IndexedRecord ────────────────────────────────────────────────────────────

/// What an [`IndexedRecord`] was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// One record per transaction in the block.
    Transaction,
    /// Payload of a taproot data envelope (`OP_FALSE OP_IF … OP_ENDIF`).
    Envelope,
    /// Protocol data carried in an `OP_RETURN` output.
    OpReturn,
    /// Protocol data hidden in a bare `OP_CHECKSIG` or `OP_CHECKMULTISIG` output.
    DataOutput,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Envelope => "envelope",
            Self::OpReturn => "op_return",
            Self::DataOutput => "data_output",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transaction" => Ok(Self::Transaction),
            "envelope" => Ok(Self::Envelope),
            "op_return" => Ok(Self::OpReturn),
            "data_output" => Ok(Self::DataOutput),
            other => Err(IndexerError::Persistence(format!("unknown record kind '{other}'"))),
        }
    }
}

/// Data derived from a block by a parser, keyed by `(height, position)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub height: u64,
    /// Position within the block, dense from 0.
    pub position: u32,
    pub kind: RecordKind,
    /// Lookup key, e.g. the txid in hex.
    pub key: String,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

// ─── Network ──────────────────────────────────────────────────────────────────

/// The Bitcoin networks the engine knows how to sync.
///
/// Serialized as its canonical name; deserialized with the same aliases as
/// [`FromStr`], so config files and `bootstrap` accept identical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet4,
    Signet,
    Regtest,
}

const MAINNET_GENESIS: BlockHash =
    BlockHash(decode_hash("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"));
const TESTNET4_GENESIS: BlockHash =
    BlockHash(decode_hash("00000000da84f2bafbbc53dee25a72ae507ff4914b867c565be350b0da8bf043"));
const SIGNET_GENESIS: BlockHash =
    BlockHash(decode_hash("00000008819873e925422c1ff0f99f7cc9bbb232af63a077a480a3633bee1ef6"));
const REGTEST_GENESIS: BlockHash =
    BlockHash(decode_hash("0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"));

impl Network {
    pub const ALL: [Network; 4] = [Self::Mainnet, Self::Testnet4, Self::Signet, Self::Regtest];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet4 => "testnet4",
            Self::Signet => "signet",
            Self::Regtest => "regtest",
        }
    }

    /// Hash of the well-known genesis block of this network.
    pub fn genesis_hash(&self) -> BlockHash {
        match self {
            Self::Mainnet => MAINNET_GENESIS,
            Self::Testnet4 => TESTNET4_GENESIS,
            Self::Signet => SIGNET_GENESIS,
            Self::Regtest => REGTEST_GENESIS,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Self::Mainnet),
            "testnet4" | "testnet" => Ok(Self::Testnet4),
            "signet" => Ok(Self::Signet),
            "regtest" => Ok(Self::Regtest),
            other => Err(IndexerError::Configuration(format!(
                "unrecognized network '{other}' (expected mainnet, testnet4, signet or regtest)"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

const fn decode_hash(s: &str) -> [u8; 32] {
    let b = s.as_bytes();
    let mut out = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        out[i] = (nibble(b[2 * i]) << 4) | nibble(b[2 * i + 1]);
        i += 1;
    }
    out
}

const fn nibble(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        _ => panic!("invalid hex digit in genesis hash"),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
