//! chainsync-bitcoin: Bitcoin block parser for the ChainSync engine.
//!
//! Decodes consensus-serialized blocks and turns them into
//! [`IndexedRecord`](chainsync_core::IndexedRecord)s:
//!
//! - one `transaction` record per transaction, keyed by txid
//! - one `envelope` record per taproot script-path input whose tapscript
//!   carries an `OP_FALSE OP_IF … OP_ENDIF` data envelope
//! - one `op_return` record per `OP_RETURN` output whose payload, ARC4-decrypted
//!   with the first input's txid, starts with the configured protocol prefix
//! - one `data_output` record per bare `OP_CHECKSIG` or `OP_CHECKMULTISIG`
//!   output hiding prefixed data the same way
//!
//! Works the same on mainnet, testnet4, signet and regtest; the network only
//! matters to the engine's genesis check.

pub mod parser;
pub mod script;

pub use parser::{BitcoinParser, BitcoinParserConfig};
