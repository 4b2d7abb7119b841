//! Script-level extraction: taproot data envelopes and protocol data in
//! `OP_RETURN`, `OP_CHECKSIG` and `OP_CHECKMULTISIG` outputs.
//!
//! Output data is ARC4-encrypted with [`data_key`] and must start with the
//! configured prefix once decrypted.

use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_ENDIF, OP_IF, OP_PUSHNUM_1, OP_PUSHNUM_16, OP_RETURN,
};
use bitcoin::opcodes::Opcode;
use bitcoin::script::{Instruction, Script};
use bitcoin::{Transaction, Witness};
use rc4::consts::U32;
use rc4::{KeyInit, Rc4, StreamCipher};

/// First byte of a taproot annex witness element.
const ANNEX_TAG: u8 = 0x50;

/// Control block first byte with the parity bit masked off.
const TAPSCRIPT_LEAF: u8 = 0xc0;

/// Returns the tapscript of a taproot script-path spend.
///
/// The witness stack is `[args…, script, control_block, (annex)]`; the
/// control block must be `33 + 32·k` bytes with tapscript leaf version.
pub fn tapscript(witness: &Witness) -> Option<&Script> {
    let mut len = witness.len();
    if witness.last().is_some_and(|e| len >= 2 && e.first() == Some(&ANNEX_TAG)) {
        len -= 1;
    }
    if len < 2 {
        return None;
    }
    let control = witness.nth(len - 1)?;
    if control.len() < 33
        || (control.len() - 33) % 32 != 0
        || control[0] & 0xfe != TAPSCRIPT_LEAF
    {
        return None;
    }
    witness.nth(len - 2).map(Script::from_bytes)
}

/// Payload of the first `OP_FALSE OP_IF <pushes…> OP_ENDIF` envelope in
/// `script`: the pushed bytes concatenated in order.
///
/// `OP_1`..`OP_16` inside the envelope count as one-byte pushes. Any other
/// opcode, or a missing `OP_ENDIF`, means there is no envelope.
pub fn envelope_payload(script: &Script) -> Option<Vec<u8>> {
    let mut instructions = script.instructions();
    let mut after_false = false;
    while let Some(instruction) = instructions.next() {
        match instruction.ok()? {
            Instruction::Op(op) if op == OP_IF && after_false => {
                let mut payload = Vec::new();
                for inner in instructions.by_ref() {
                    match inner.ok()? {
                        Instruction::PushBytes(bytes) => payload.extend_from_slice(bytes.as_bytes()),
                        Instruction::Op(op) if op == OP_ENDIF => return Some(payload),
                        Instruction::Op(op)
                            if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&op.to_u8()) =>
                        {
                            payload.push(op.to_u8() - OP_PUSHNUM_1.to_u8() + 1);
                        }
                        Instruction::Op(_) => return None,
                    }
                }
                return None;
            }
            Instruction::PushBytes(bytes) => after_false = bytes.is_empty(),
            Instruction::Op(_) => after_false = false,
        }
    }
    None
}

/// Unencrypted `OP_RETURN` push that marks a taproot reveal transaction.
pub const TAPROOT_MARKER: &[u8] = b"CNTRPRTY";

/// ARC4 key for the data outputs of `tx`: the txid spent by its first input,
/// in display byte order. `None` for a transaction without inputs.
pub fn data_key(tx: &Transaction) -> Option<[u8; 32]> {
    let input = tx.input.first()?;
    let mut key = input.previous_output.txid.to_byte_array();
    key.reverse();
    Some(key)
}

pub fn arc4(key: &[u8; 32], data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    Rc4::<U32>::new(key.into()).apply_keystream(&mut out);
    out
}

/// Data carried by an `OP_RETURN <push>` output.
///
/// The bare [`TAPROOT_MARKER`] is returned as is. Anything else is decrypted
/// and kept only if it starts with `prefix`, which is stripped.
pub fn op_return_payload(
    script: &Script,
    prefix: &[u8],
    key: Option<&[u8; 32]>,
) -> Option<Vec<u8>> {
    let instructions = instructions(script)?;
    let [Instruction::Op(op), Instruction::PushBytes(data)] = instructions.as_slice() else {
        return None;
    };
    if *op != OP_RETURN {
        return None;
    }
    let data = data.as_bytes();
    if data == TAPROOT_MARKER {
        return Some(data.to_vec());
    }
    arc4(key?, data).strip_prefix(prefix).map(<[u8]>::to_vec)
}

/// Data hidden in the third element of an output ending in `OP_CHECKSIG`
/// (the pubkey hash slot of a P2PKH script).
pub fn checksig_payload(
    script: &Script,
    prefix: &[u8],
    key: Option<&[u8; 32]>,
) -> Option<Vec<u8>> {
    let instructions = instructions(script)?;
    if instructions.len() < 3 || !ends_with(&instructions, OP_CHECKSIG) {
        return None;
    }
    let chunk = match &instructions[2] {
        Instruction::PushBytes(bytes) => bytes.as_bytes().to_vec(),
        Instruction::Op(op) if *op == OP_PUSHNUM_1 => vec![1],
        Instruction::Op(op) => vec![op.to_u8()],
    };
    length_prefixed(&arc4(key?, &chunk), prefix)
}

/// Data hidden in the pubkeys of a 1-of-2 up to 3-of-3 bare multisig output.
///
/// Every key but the last carries data between its sign byte and its final
/// nonce byte. Scripts that push the `m` and `n` counts instead of using
/// small-integer opcodes are accepted too.
pub fn multisig_payload(
    script: &Script,
    prefix: &[u8],
    key: Option<&[u8; 32]>,
) -> Option<Vec<u8>> {
    let instructions = instructions(script)?;
    if !ends_with(&instructions, OP_CHECKMULTISIG) {
        return None;
    }
    let body = &instructions[..instructions.len() - 1];
    let [first, pubkeys @ .., count] = body else {
        return None;
    };
    let pubkeys: Vec<&[u8]> = pubkeys
        .iter()
        .map(|i| match i {
            Instruction::PushBytes(bytes) => Some(bytes.as_bytes()),
            Instruction::Op(_) => None,
        })
        .collect::<Option<_>>()?;
    if !(2..=3).contains(&pubkeys.len()) {
        return None;
    }
    let well_formed = match (first, count) {
        (Instruction::Op(m), Instruction::Op(n)) => {
            small_int(*m).is_some_and(|m| (1..=3).contains(&m)) && small_int(*n) == Some(pubkeys.len())
        }
        (Instruction::PushBytes(_), Instruction::PushBytes(_)) => true,
        _ => false,
    };
    if !well_formed {
        return None;
    }

    let (_, data_keys) = pubkeys.split_last()?;
    let mut encrypted = Vec::new();
    for pubkey in data_keys {
        if pubkey.len() < 2 {
            return None;
        }
        encrypted.extend_from_slice(&pubkey[1..pubkey.len() - 1]);
    }
    length_prefixed(&arc4(key?, &encrypted), prefix)
}

/// `[len, prefix…, data…, padding…]`: the `len` bytes after the length byte,
/// with `prefix` stripped.
fn length_prefixed(plain: &[u8], prefix: &[u8]) -> Option<Vec<u8>> {
    let (&len, rest) = plain.split_first()?;
    if !rest.starts_with(prefix) {
        return None;
    }
    let len = usize::from(len).min(rest.len());
    rest[..len].strip_prefix(prefix).map(<[u8]>::to_vec)
}

fn instructions(script: &Script) -> Option<Vec<Instruction<'_>>> {
    script.instructions().collect::<Result<_, _>>().ok()
}

fn ends_with(instructions: &[Instruction<'_>], opcode: Opcode) -> bool {
    matches!(instructions.last(), Some(Instruction::Op(op)) if *op == opcode)
}

fn small_int(op: Opcode) -> Option<usize> {
    let (lo, hi) = (OP_PUSHNUM_1.to_u8(), OP_PUSHNUM_16.to_u8());
    (lo..=hi).contains(&op.to_u8()).then(|| usize::from(op.to_u8() - lo + 1))
}
