//! `BitcoinParser` consensus-decodes raw blocks into indexed records.

use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use serde::{Deserialize, Serialize};

use chainsync_core::error::IndexerError;
use chainsync_core::parser::BlockParser;
use chainsync_core::types::{Block, BlockHash, IndexedRecord, RecordKind};

use crate::script::{
    checksig_payload, data_key, envelope_payload, multisig_payload, op_return_payload, tapscript,
};

/// Default OP_RETURN protocol prefix.
pub const DEFAULT_PREFIX: &str = "CNTRPRTY";

/// Parser settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitcoinParserConfig {
    /// Decrypted output data must start with this to be indexed.
    pub prefix: String,
}

impl Default for BitcoinParserConfig {
    fn default() -> Self {
        Self { prefix: DEFAULT_PREFIX.into() }
    }
}

/// Parses Bitcoin blocks for any of the supported networks.
#[derive(Debug, Clone, Default)]
pub struct BitcoinParser {
    config: BitcoinParserConfig,
}

impl BitcoinParser {
    pub fn new(config: BitcoinParserConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BitcoinParserConfig {
        &self.config
    }
}

impl BlockParser for BitcoinParser {
    fn parse(&self, block: &Block) -> Result<Vec<IndexedRecord>, IndexerError> {
        let height = block.height;
        let decoded = decode(block)?;

        let header_hash = to_block_hash(decoded.block_hash());
        if header_hash != block.hash {
            return Err(parse_error(
                height,
                format!("header hashes to {header_hash}, block claims {}", block.hash),
            ));
        }
        let prev = to_block_hash(decoded.header.prev_blockhash);
        if prev != block.parent_hash {
            return Err(parse_error(
                height,
                format!("header parent is {prev}, block claims {}", block.parent_hash),
            ));
        }
        if !decoded.check_merkle_root() {
            return Err(parse_error(height, "merkle root does not match transactions".into()));
        }

        let prefix = self.config.prefix.as_bytes();
        let mut records = Vec::new();
        let mut push = |kind: RecordKind, key: String, data: Vec<u8>| {
            let position = records.len() as u32;
            records.push(IndexedRecord { height, position, kind, key, data });
        };

        for tx in &decoded.txdata {
            let txid = tx.compute_txid();
            let key = data_key(tx);
            push(RecordKind::Transaction, txid.to_string(), encode::serialize(tx));

            for (vin, input) in tx.input.iter().enumerate() {
                if let Some(payload) = tapscript(&input.witness).and_then(envelope_payload) {
                    push(RecordKind::Envelope, format!("{txid}:i{vin}"), payload);
                }
            }
            for (vout, output) in tx.output.iter().enumerate() {
                let script = &output.script_pubkey;
                let key = key.as_ref();
                if let Some(payload) = op_return_payload(script, prefix, key) {
                    push(RecordKind::OpReturn, format!("{txid}:{vout}"), payload);
                } else if let Some(payload) = checksig_payload(script, prefix, key)
                    .or_else(|| multisig_payload(script, prefix, key))
                {
                    push(RecordKind::DataOutput, format!("{txid}:{vout}"), payload);
                }
            }
        }

        tracing::trace!(height, txs = decoded.txdata.len(), records = records.len(), "parsed block");
        Ok(records)
    }
}

/// Build a [`Block`] from consensus-serialized bytes, taking the hash and
/// parent hash from the header.
pub fn block_from_raw(height: u64, raw: Vec<u8>) -> Result<Block, IndexerError> {
    let header: bitcoin::block::Header = encode::deserialize_partial(&raw)
        .map(|(header, _)| header)
        .map_err(|e| parse_error(height, format!("invalid block header: {e}")))?;
    Ok(Block {
        height,
        hash: to_block_hash(header.block_hash()),
        parent_hash: to_block_hash(header.prev_blockhash),
        timestamp: i64::from(header.time),
        raw,
    })
}

fn decode(block: &Block) -> Result<bitcoin::Block, IndexerError> {
    encode::deserialize(&block.raw)
        .map_err(|e| parse_error(block.height, format!("invalid block encoding: {e}")))
}

/// rust-bitcoin keeps hashes in internal byte order; ours are display order.
fn to_block_hash(hash: bitcoin::BlockHash) -> BlockHash {
    let mut bytes = hash.to_byte_array();
    bytes.reverse();
    BlockHash(bytes)
}

fn parse_error(height: u64, reason: String) -> IndexerError {
    IndexerError::Parse { height, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::tests::{
        checksig_data, encrypted_op_return, envelope_script, op_return, script_path_witness,
    };
    use bitcoin::absolute::LockTime;
    use bitcoin::block::{Header, Version};
    use bitcoin::transaction;
    use bitcoin::{
        Amount, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode,
        TxOut, Witness,
    };
    use chainsync_core::types::Network;

    fn tx(witnesses: Vec<Witness>, outputs: Vec<ScriptBuf>) -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: witnesses
                .into_iter()
                .map(|witness| TxIn {
                    previous_output: OutPoint::null(),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness,
                })
                .collect(),
            output: outputs
                .into_iter()
                .map(|script_pubkey| TxOut { value: Amount::from_sat(0), script_pubkey })
                .collect(),
        }
    }

    /// Data key of transactions spending `OutPoint::null()`.
    const NULL_KEY: [u8; 32] = [0; 32];

    fn coinbase() -> Transaction {
        tx(vec![Witness::new()], vec![ScriptBuf::new()])
    }

    fn raw_block(prev: bitcoin::BlockHash, txdata: Vec<Transaction>) -> bitcoin::Block {
        let mut block = bitcoin::Block {
            header: Header {
                version: Version::ONE,
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_700_000_000,
                bits: CompactTarget::from_consensus(0x207f_ffff),
                nonce: 0,
            },
            txdata,
        };
        block.header.merkle_root = block.compute_merkle_root().unwrap();
        block
    }

    fn to_core(height: u64, block: &bitcoin::Block) -> Block {
        block_from_raw(height, encode::serialize(block)).unwrap()
    }

    #[test]
    fn parses_mainnet_genesis() {
        let genesis = bitcoin::constants::genesis_block(bitcoin::Network::Bitcoin);
        let block = to_core(0, &genesis);
        assert_eq!(block.hash, Network::Mainnet.genesis_hash());
        assert_eq!(block.parent_hash, BlockHash::ZERO);

        let records = BitcoinParser::default().parse(&block).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::Transaction);
        assert_eq!(
            records[0].key,
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
    }

    #[test]
    fn extracts_envelopes_and_op_returns() {
        let envelope = envelope_script(&[b"CNTRPRTY", b"\x01issue"]);
        let txs = vec![
            coinbase(),
            tx(
                vec![script_path_witness(&envelope), Witness::new()],
                vec![
                    encrypted_op_return(&NULL_KEY, b"CNTRPRTY", b"send"),
                    op_return(b"other"),
                    checksig_data(&NULL_KEY, b"CNTRPRTY", b"abc"),
                    ScriptBuf::new(),
                ],
            ),
        ];
        let block = to_core(7, &raw_block(bitcoin::BlockHash::all_zeros(), txs));

        let records = BitcoinParser::default().parse(&block).unwrap();
        let kinds: Vec<RecordKind> = records.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RecordKind::Transaction,
                RecordKind::Transaction,
                RecordKind::Envelope,
                RecordKind::OpReturn,
                RecordKind::DataOutput,
            ]
        );
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.position, i as u32);
            assert_eq!(r.height, 7);
        }
        let txid = &records[1].key;
        assert_eq!(records[2].key, format!("{txid}:i0"));
        assert_eq!(records[2].data, b"CNTRPRTY\x01issue".to_vec());
        assert_eq!(records[3].key, format!("{txid}:0"));
        assert_eq!(records[3].data, b"send".to_vec());
        assert_eq!(records[4].key, format!("{txid}:2"));
        assert_eq!(records[4].data, b"abc".to_vec());
    }

    #[test]
    fn output_data_is_keyed_by_first_input() {
        let prev: bitcoin::Txid = "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20"
            .parse()
            .unwrap();
        let cipher: Vec<u8> = [
            0xa9, 0xe8, 0xe9, 0x77, 0xd8, 0x59, 0xad, 0x64, 0x3f, 0x5d, 0x1e, 0x58, 0xca, 0x04,
            0x71, 0xfd, 0xa0,
        ]
        .to_vec();
        let mut data_tx = tx(vec![Witness::new()], vec![op_return(&cipher)]);
        data_tx.input[0].previous_output = OutPoint::new(prev, 0);
        let block = to_core(9, &raw_block(bitcoin::BlockHash::all_zeros(), vec![coinbase(), data_tx]));

        let records = BitcoinParser::default().parse(&block).unwrap();
        let data = records.iter().find(|r| r.kind == RecordKind::OpReturn).unwrap();
        assert_eq!(data.data, vec![0, 0, 0, 0x14, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn bare_marker_is_indexed_for_any_prefix() {
        let txs = vec![coinbase(), tx(vec![Witness::new()], vec![op_return(b"CNTRPRTY")])];
        let block = to_core(6, &raw_block(bitcoin::BlockHash::all_zeros(), txs));
        let parser = BitcoinParser::new(BitcoinParserConfig { prefix: "XCP".into() });
        let records = parser.parse(&block).unwrap();
        assert_eq!(records.last().unwrap().kind, RecordKind::OpReturn);
        assert_eq!(records.last().unwrap().data, b"CNTRPRTY".to_vec());
    }

    #[test]
    fn custom_prefix() {
        let txs = vec![coinbase(), tx(vec![Witness::new()], vec![encrypted_op_return(&NULL_KEY, b"XCP", b"data")])];
        let block = to_core(1, &raw_block(bitcoin::BlockHash::all_zeros(), txs));

        let parser = BitcoinParser::new(BitcoinParserConfig { prefix: "XCP".into() });
        let records = parser.parse(&block).unwrap();
        assert_eq!(records.last().unwrap().kind, RecordKind::OpReturn);
        assert_eq!(records.last().unwrap().data, b"data".to_vec());

        assert!(BitcoinParser::default()
            .parse(&block)
            .unwrap()
            .iter()
            .all(|r| r.kind == RecordKind::Transaction));
    }

    #[test]
    fn parsing_is_deterministic() {
        let envelope = envelope_script(&[b"abc"]);
        let txs = vec![
            coinbase(),
            tx(
                vec![script_path_witness(&envelope)],
                vec![encrypted_op_return(&NULL_KEY, b"CNTRPRTY", b"x")],
            ),
        ];
        let block = to_core(3, &raw_block(bitcoin::BlockHash::all_zeros(), txs));
        let parser = BitcoinParser::default();
        assert_eq!(parser.parse(&block).unwrap(), parser.parse(&block).unwrap());
    }

    #[test]
    fn rejects_wrong_hash() {
        let mut block = to_core(2, &raw_block(bitcoin::BlockHash::all_zeros(), vec![coinbase()]));
        block.hash = BlockHash([9; 32]);
        let err = BitcoinParser::default().parse(&block).unwrap_err();
        assert!(matches!(err, IndexerError::Parse { height: 2, .. }));
    }

    #[test]
    fn rejects_wrong_parent() {
        let mut block = to_core(2, &raw_block(bitcoin::BlockHash::all_zeros(), vec![coinbase()]));
        block.parent_hash = BlockHash([1; 32]);
        assert!(BitcoinParser::default().parse(&block).is_err());
    }

    #[test]
    fn rejects_bad_merkle_root() {
        let mut raw = raw_block(bitcoin::BlockHash::all_zeros(), vec![coinbase()]);
        raw.txdata.push(tx(vec![Witness::new()], vec![op_return(b"CNTRPRTYlate")]));
        let block = to_core(4, &raw);
        let err = BitcoinParser::default().parse(&block).unwrap_err();
        assert!(err.to_string().contains("merkle"));
    }

    #[test]
    fn rejects_truncated_bytes() {
        let mut block = to_core(5, &raw_block(bitcoin::BlockHash::all_zeros(), vec![coinbase()]));
        block.raw.truncate(block.raw.len() - 3);
        let err = BitcoinParser::default().parse(&block).unwrap_err();
        assert!(matches!(err, IndexerError::Parse { height: 5, .. }));
        assert!(block_from_raw(5, vec![0u8; 10]).is_err());
    }

    #[test]
    fn config_from_json() {
        let cfg: BitcoinParserConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.prefix, "CNTRPRTY");
        let cfg: BitcoinParserConfig = serde_json::from_str(r#"{ "prefix": "XCP" }"#).unwrap();
        assert_eq!(cfg.prefix, "XCP");
    }
}
