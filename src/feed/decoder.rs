//! Raw transaction and block decoding
//!
//! Parses the node's `rawtx` / `rawblock` payloads (Bitcoin Cash serialization,
//! no witness data) into display-ready records. Decoding is pure: every failure
//! is a [`DecodeError`] for that one message and never a panic.

use super::registry::LiveChannel;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

const HEADER_LEN: usize = 80;
const MIN_INPUT_LEN: usize = 32 + 4 + 1 + 4;
const MIN_OUTPUT_LEN: usize = 8 + 1;
const MIN_TX_LEN: usize = 4 + 1 + MIN_INPUT_LEN + 1 + MIN_OUTPUT_LEN + 4;

/// Upstream topic a payload was published under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedTopic {
    RawTx,
    RawBlock,
}

impl FeedTopic {
    pub const ALL: [FeedTopic; 2] = [FeedTopic::RawTx, FeedTopic::RawBlock];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedTopic::RawTx => "rawtx",
            FeedTopic::RawBlock => "rawblock",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "rawtx" => Some(FeedTopic::RawTx),
            "rawblock" => Some(FeedTopic::RawBlock),
            _ => None,
        }
    }
}

impl std::fmt::Display for FeedTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),

    #[error("truncated at offset {offset}: {needed} more bytes needed")]
    Truncated { offset: usize, needed: usize },

    #[error("non-canonical compact size at offset {0}")]
    NonCanonicalCompactSize(usize),

    #[error("{count} {what} declared but only {remaining} bytes remain")]
    ImplausibleCount {
        what: &'static str,
        count: u64,
        remaining: usize,
    },

    #[error("no {0}")]
    Empty(&'static str),

    #[error("output values overflow")]
    ValueOverflow,

    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// Standard output script shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    P2pkh,
    P2sh,
    P2pk,
    Nulldata,
    Nonstandard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxInput {
    pub prev_txid: String,
    pub vout: u32,
    pub script_sig: String,
    pub sequence: u32,
    pub coinbase: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxOutput {
    pub n: u32,
    /// Satoshis
    pub value: u64,
    pub script_pubkey: String,
    pub script_type: ScriptType,
    /// Hash160 for p2pkh/p2sh, public key for p2pk, payload for nulldata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedTransaction {
    pub txid: String,
    pub version: i32,
    pub locktime: u32,
    pub size: usize,
    pub value_out: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedBlock {
    pub hash: String,
    pub version: i32,
    pub prev_hash: String,
    pub merkle_root: String,
    pub time: u32,
    pub bits: String,
    pub nonce: u32,
    pub size: usize,
    pub tx_count: usize,
    pub txids: Vec<String>,
}

/// Structured record produced from one upstream message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DecodedEvent {
    Transaction(DecodedTransaction),
    Block(DecodedBlock),
}

impl DecodedEvent {
    /// Live channel this event is relayed on
    pub fn channel(&self) -> LiveChannel {
        match self {
            DecodedEvent::Transaction(_) => LiveChannel::Transactions,
            DecodedEvent::Block(_) => LiveChannel::Blocks,
        }
    }
}

/// Stateless decoder for upstream payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct EventDecoder;

impl EventDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode a payload according to its topic label.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<DecodedEvent, DecodeError> {
        match FeedTopic::parse(topic) {
            Some(FeedTopic::RawTx) => decode_transaction(payload).map(DecodedEvent::Transaction),
            Some(FeedTopic::RawBlock) => decode_block(payload).map(DecodedEvent::Block),
            None => Err(DecodeError::UnknownTopic(topic.to_string())),
        }
    }
}

pub fn decode_transaction(payload: &[u8]) -> Result<DecodedTransaction, DecodeError> {
    let mut reader = Reader::new(payload);
    let tx = read_transaction(&mut reader)?;
    reader.finish()?;
    Ok(tx)
}

pub fn decode_block(payload: &[u8]) -> Result<DecodedBlock, DecodeError> {
    let mut reader = Reader::new(payload);

    let header = reader.take(HEADER_LEN)?;
    let mut header_reader = Reader::new(header);
    let version = header_reader.i32_le()?;
    let prev_hash = display_hash(header_reader.take(32)?);
    let merkle_root = display_hash(header_reader.take(32)?);
    let time = header_reader.u32_le()?;
    let bits = header_reader.u32_le()?;
    let nonce = header_reader.u32_le()?;

    let tx_count = reader.count("transactions", MIN_TX_LEN)?;
    if tx_count == 0 {
        return Err(DecodeError::Empty("transactions in block"));
    }

    let mut txids = Vec::with_capacity(tx_count);
    for _ in 0..tx_count {
        txids.push(read_transaction(&mut reader)?.txid);
    }
    reader.finish()?;

    Ok(DecodedBlock {
        hash: display_hash(&double_sha256(header)),
        version,
        prev_hash,
        merkle_root,
        time,
        bits: format!("{:08x}", bits),
        nonce,
        size: payload.len(),
        tx_count,
        txids,
    })
}

fn read_transaction(reader: &mut Reader<'_>) -> Result<DecodedTransaction, DecodeError> {
    let start = reader.position();
    let version = reader.i32_le()?;

    let input_count = reader.count("inputs", MIN_INPUT_LEN)?;
    if input_count == 0 {
        return Err(DecodeError::Empty("inputs"));
    }
    let mut inputs = Vec::with_capacity(input_count);
    for _ in 0..input_count {
        let prev = reader.take(32)?;
        let vout = reader.u32_le()?;
        let script_sig = hex::encode(reader.var_bytes()?);
        let sequence = reader.u32_le()?;
        inputs.push(TxInput {
            coinbase: vout == u32::MAX && prev.iter().all(|b| *b == 0),
            prev_txid: display_hash(prev),
            vout,
            script_sig,
            sequence,
        });
    }

    let output_count = reader.count("outputs", MIN_OUTPUT_LEN)?;
    if output_count == 0 {
        return Err(DecodeError::Empty("outputs"));
    }
    let mut outputs = Vec::with_capacity(output_count);
    let mut value_out: u64 = 0;
    for n in 0..output_count {
        let value = reader.u64_le()?;
        value_out = value_out
            .checked_add(value)
            .ok_or(DecodeError::ValueOverflow)?;
        let script = reader.var_bytes()?;
        let (script_type, data) = classify_script(script);
        outputs.push(TxOutput {
            n: n as u32,
            value,
            script_pubkey: hex::encode(script),
            script_type,
            data,
        });
    }

    let locktime = reader.u32_le()?;
    let raw = reader.since(start);

    Ok(DecodedTransaction {
        txid: display_hash(&double_sha256(raw)),
        version,
        locktime,
        size: raw.len(),
        value_out,
        inputs,
        outputs,
    })
}

fn classify_script(script: &[u8]) -> (ScriptType, Option<String>) {
    match script {
        [0x76, 0xa9, 0x14, hash @ .., 0x88, 0xac] if hash.len() == 20 => {
            (ScriptType::P2pkh, Some(hex::encode(hash)))
        }
        [0xa9, 0x14, hash @ .., 0x87] if hash.len() == 20 => {
            (ScriptType::P2sh, Some(hex::encode(hash)))
        }
        [len, key @ .., 0xac] if (*len == 33 || *len == 65) && key.len() == *len as usize => {
            (ScriptType::P2pk, Some(hex::encode(key)))
        }
        [0x6a, payload @ ..] => (ScriptType::Nulldata, Some(hex::encode(payload))),
        _ => (ScriptType::Nonstandard, None),
    }
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(data)).into()
}

/// Hashes are shown byte-reversed, as nodes and explorers display them
fn display_hash(internal: &[u8]) -> String {
    let mut bytes = internal.to_vec();
    bytes.reverse();
    hex::encode(bytes)
}

/// Bounds-checked cursor over a payload
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn since(&self, start: usize) -> &'a [u8] {
        &self.data[start..self.pos]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n - self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32_le(&mut self) -> Result<u32, DecodeError> {
        self.array().map(u32::from_le_bytes)
    }

    fn i32_le(&mut self) -> Result<i32, DecodeError> {
        self.array().map(i32::from_le_bytes)
    }

    fn u64_le(&mut self) -> Result<u64, DecodeError> {
        self.array().map(u64::from_le_bytes)
    }

    fn compact_size(&mut self) -> Result<u64, DecodeError> {
        let offset = self.pos;
        let (value, minimum) = match self.u8()? {
            0xfd => (self.array().map(u16::from_le_bytes)? as u64, 0xfd),
            0xfe => (self.u32_le()? as u64, 0x1_0000),
            0xff => (self.u64_le()?, 0x1_0000_0000),
            small => return Ok(small as u64),
        };
        if value < minimum {
            return Err(DecodeError::NonCanonicalCompactSize(offset));
        }
        Ok(value)
    }

    /// Element count that the remaining bytes could plausibly hold
    fn count(&mut self, what: &'static str, min_element_len: usize) -> Result<usize, DecodeError> {
        let count = self.compact_size()?;
        let remaining = self.remaining();
        match usize::try_from(count) {
            Ok(n) if n.saturating_mul(min_element_len) <= remaining => Ok(n),
            _ => Err(DecodeError::ImplausibleCount {
                what,
                count,
                remaining,
            }),
        }
    }

    fn var_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let offset = self.pos;
        let len = self.compact_size()?;
        let remaining = self.remaining();
        match usize::try_from(len) {
            Ok(n) if n <= remaining => self.take(n),
            _ => Err(DecodeError::Truncated {
                offset,
                needed: usize::try_from(len)
                    .unwrap_or(usize::MAX)
                    .saturating_sub(remaining),
            }),
        }
    }

    fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(DecodeError::TrailingBytes(extra)),
        }
    }
}
