//! Bitcoin transactions
//!
//! Wire (de)serialization including the segwit marker, identity hashing
//! over the witness-stripped form and the legacy SIGHASH_ALL digest used
//! to sign P2PKH inputs. The wallet-side flags (`is_mine`, `processed`,
//! `spent`) travel with the transaction into the store.

use serde::{Deserialize, Serialize};

use crate::core::encode::{DecodeError, Reader, WriteExt};
use crate::core::script::{parse_output_script, ScriptType};
use crate::crypto::{double_sha256, to_reversed_hex, Hash};

// =============================================================================
// Constants
// =============================================================================

/// Default transaction version
pub const TX_VERSION: i32 = 1;

/// Sequence number that disables locktime and replacement
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

/// SIGHASH_ALL, appended to both the digest preimage and the signature
pub const SIGHASH_ALL: u32 = 0x01;

// =============================================================================
// Outpoint
// =============================================================================

/// Reference to an output of a previous transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Previous transaction hash (wire order)
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// 36-byte wire form, as inserted into Bloom filters
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..32].copy_from_slice(&self.hash);
        out[32..].copy_from_slice(&self.index.to_le_bytes());
        out
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            hash: reader.read_hash()?,
            index: reader.read_u32_le()?,
        })
    }
}

// =============================================================================
// Transaction Input
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub previous_output: OutPoint,
    /// Unlocking script
    pub sig_script: Vec<u8>,
    pub sequence: u32,
    #[serde(default)]
    pub witness: Vec<Vec<u8>>,
    /// Key hash of the output being spent, once linked
    #[serde(default)]
    pub key_hash: Option<Vec<u8>>,
    #[serde(default)]
    pub address: Option<String>,
}

impl TransactionInput {
    pub fn new(previous_output: OutPoint, sig_script: Vec<u8>) -> Self {
        Self {
            previous_output,
            sig_script,
            sequence: SEQUENCE_FINAL,
            witness: Vec::new(),
            key_hash: None,
            address: None,
        }
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let previous_output = OutPoint::read(reader)?;
        let sig_script = reader.read_var_bytes()?;
        let mut input = Self::new(previous_output, sig_script);
        input.sequence = reader.read_u32_le()?;
        Ok(input)
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.previous_output.to_bytes());
        out.put_var_bytes(&self.sig_script);
        out.extend_from_slice(&self.sequence.to_le_bytes());
    }
}

// =============================================================================
// Transaction Output
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    /// Value in satoshis
    pub value: u64,
    /// Locking script
    pub lock_script: Vec<u8>,
    /// Position within the owning transaction
    pub index: u32,
    pub script_type: ScriptType,
    pub key_hash: Option<Vec<u8>>,
    #[serde(default)]
    pub address: Option<String>,
    /// Set once a wallet transaction spends this output
    #[serde(default)]
    pub spent: bool,
    #[serde(default)]
    pub is_mine: bool,
}

impl TransactionOutput {
    pub fn new(value: u64, lock_script: Vec<u8>, index: u32) -> Self {
        let parsed = parse_output_script(&lock_script);
        Self {
            value,
            lock_script,
            index,
            script_type: parsed.script_type,
            key_hash: parsed.key_hash,
            address: None,
            spent: false,
            is_mine: false,
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// Broadcast state of a wallet transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    New,
    Relayed,
    Invalid,
}

impl Default for TransactionStatus {
    fn default() -> Self {
        TransactionStatus::Relayed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
    hash: Hash,
    #[serde(default)]
    pub status: TransactionStatus,
    #[serde(default)]
    pub is_mine: bool,
    #[serde(default)]
    pub processed: bool,
    /// Block that confirmed this transaction, if known
    #[serde(default)]
    pub block_hash: Option<Hash>,
}

impl Transaction {
    pub fn new(
        version: i32,
        inputs: Vec<TransactionInput>,
        outputs: Vec<TransactionOutput>,
        lock_time: u32,
    ) -> Self {
        let mut tx = Self {
            version,
            inputs,
            outputs,
            lock_time,
            hash: [0u8; 32],
            status: TransactionStatus::default(),
            is_mine: false,
            processed: false,
            block_hash: None,
        };
        tx.update_hash();
        tx
    }

    /// Transaction hash (wire order)
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Transaction hash in display order
    pub fn hash_hex(&self) -> String {
        to_reversed_hex(&self.hash)
    }

    /// Recompute the identity after inputs or outputs changed
    pub fn update_hash(&mut self) {
        self.hash = double_sha256(&self.encode(false));
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Full wire form, with witness data when present
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode(true)
    }

    fn encode(&self, with_witness: bool) -> Vec<u8> {
        let segwit = with_witness && self.has_witness();
        let mut out = Vec::with_capacity(10 + self.inputs.len() * 148 + self.outputs.len() * 34);

        out.extend_from_slice(&self.version.to_le_bytes());
        if segwit {
            out.extend_from_slice(&[0x00, 0x01]);
        }

        out.put_var_int(self.inputs.len() as u64);
        for input in &self.inputs {
            input.write(&mut out);
        }

        out.put_var_int(self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            out.put_var_bytes(&output.lock_script);
        }

        if segwit {
            for input in &self.inputs {
                out.put_var_int(input.witness.len() as u64);
                for item in &input.witness {
                    out.put_var_bytes(item);
                }
            }
        }

        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    pub fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = reader.read_i32_le()?;

        let mut input_count = reader.read_length()?;
        let segwit = input_count == 0;
        if segwit {
            let flag = reader.read_u8()?;
            if flag != 0x01 {
                return Err(DecodeError::InvalidData(format!(
                    "unexpected segwit flag {}",
                    flag
                )));
            }
            input_count = reader.read_length()?;
        }

        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(TransactionInput::read(reader)?);
        }

        let output_count = reader.read_length()?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for index in 0..output_count {
            let value = reader.read_u64_le()?;
            let lock_script = reader.read_var_bytes()?;
            outputs.push(TransactionOutput::new(value, lock_script, index as u32));
        }

        if segwit {
            for input in &mut inputs {
                let items = reader.read_length()?;
                for _ in 0..items {
                    input.witness.push(reader.read_var_bytes()?);
                }
            }
        }

        let lock_time = reader.read_u32_le()?;
        Ok(Self::new(version, inputs, outputs, lock_time))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(data);
        let tx = Self::read(&mut reader)?;
        if !reader.is_empty() {
            return Err(DecodeError::InvalidData(format!(
                "{} trailing bytes after transaction",
                reader.remaining()
            )));
        }
        Ok(tx)
    }

    /// Legacy SIGHASH_ALL digest for signing input `index`, which spends
    /// an output locked by `prev_lock_script`
    pub fn signature_hash(&self, index: usize, prev_lock_script: &[u8]) -> Hash {
        let mut copy = self.clone();
        for (i, input) in copy.inputs.iter_mut().enumerate() {
            input.sig_script = if i == index {
                prev_lock_script.to_vec()
            } else {
                Vec::new()
            };
        }

        let mut preimage = copy.encode(false);
        preimage.extend_from_slice(&SIGHASH_ALL.to_le_bytes());
        double_sha256(&preimage)
    }

    /// Total value of all outputs
    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::from_reversed_hex;

    // First spend from the block 170 coinbase (Satoshi to Hal Finney)
    const BLOCK_170_TX: &str = "0100000001c997a5e56e104102fa209c6a852dd90660a20b2d9c352423edce25857fcd3704000000004847304402204e45e16932b8af514961a1d3a1a25fdf3f4f7732e9d624c6c61548ab5fb8cd410220181522ec8eca07de4860a4acdd12909d831cc56cbbac4622082221a8768d1d0901ffffffff0200ca9a3b00000000434104ae1a62fe09c5f51b13905f07f06b99a2f7159b2225f374cd378d71302fa28414e7aab37397f554a7df5f142c21c1b7303b8a0626f1baded5c72a704f7e6cd84cac00286bee0000000043410411db93e1dcdb8a016b49840f8c53bc1eb68a382e97b1482ecad7b148a6909a5cb2e0eaddfb84ccf9744464f82e160bfa9b8b64f9d4c03f999b8643f656b412a3ac00000000";

    #[test]
    fn test_parse_known_transaction() {
        let bytes = hex::decode(BLOCK_170_TX).unwrap();
        let tx = Transaction::from_bytes(&bytes).unwrap();

        assert_eq!(
            tx.hash_hex(),
            "f4184fc596403b9d638783cf57adfe4c75c605f6356fbc91338530e9831e9e16"
        );
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(
            tx.inputs[0].previous_output.hash,
            from_reversed_hex("0437cd7f8525ceed2324359c2d0ba26006d92d856a9c20fa0241106ee5a597c9")
                .unwrap()
        );
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].value, 1_000_000_000);
        assert_eq!(tx.outputs[1].value, 4_000_000_000);
        assert_eq!(tx.outputs[1].index, 1);
        assert_eq!(tx.outputs[0].script_type, ScriptType::P2PK);
        assert_eq!(tx.to_bytes(), bytes);
    }

    #[test]
    fn test_segwit_serialization_keeps_txid() {
        let mut input = TransactionInput::new(OutPoint::new([1u8; 32], 0), vec![]);
        input.witness = vec![vec![0x30; 71], vec![0x02; 33]];
        let output = TransactionOutput::new(
            50_000,
            hex::decode("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap(),
            0,
        );
        let tx = Transaction::new(2, vec![input], vec![output], 0);

        let bytes = tx.to_bytes();
        assert_eq!(&bytes[4..6], &[0x00, 0x01]);

        let parsed = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.hash(), tx.hash());
        assert_eq!(parsed.inputs[0].witness, tx.inputs[0].witness);
        assert_eq!(parsed.outputs[0].script_type, ScriptType::P2WPKH);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = hex::decode(BLOCK_170_TX).unwrap();
        bytes.push(0);
        assert!(Transaction::from_bytes(&bytes).is_err());
        assert!(Transaction::from_bytes(&bytes[..40]).is_err());
    }

    #[test]
    fn test_signature_hash_commits_to_signed_input_only() {
        let tx = Transaction::new(
            1,
            vec![
                TransactionInput::new(OutPoint::new([1u8; 32], 0), vec![0xaa]),
                TransactionInput::new(OutPoint::new([2u8; 32], 1), vec![0xbb]),
            ],
            vec![TransactionOutput::new(1_000, vec![0x51], 0)],
            0,
        );
        let script = [0x76, 0xa9];

        let first = tx.signature_hash(0, &script);
        let second = tx.signature_hash(1, &script);
        assert_ne!(first, second);

        // Existing unlocking scripts do not influence the digest
        let mut resigned = tx.clone();
        resigned.inputs[1].sig_script = vec![0xcc; 10];
        assert_eq!(resigned.signature_hash(0, &script), first);
    }

    #[test]
    fn test_update_hash_tracks_mutation() {
        let mut tx = Transaction::new(
            1,
            vec![TransactionInput::new(OutPoint::new([1u8; 32], 0), vec![])],
            vec![TransactionOutput::new(1_000, vec![0x51], 0)],
            0,
        );
        let before = tx.hash();
        assert_eq!(before, double_sha256(&tx.to_bytes()));

        tx.outputs[0].value = 2_000;
        tx.update_hash();
        assert_ne!(tx.hash(), before);
        assert_eq!(tx.hash(), double_sha256(&tx.to_bytes()));

        // Witness data never changes the txid
        let txid = tx.hash();
        tx.inputs[0].witness = vec![vec![0x02; 33]];
        tx.update_hash();
        assert_eq!(tx.hash(), txid);
        assert_ne!(double_sha256(&tx.to_bytes()), txid);
    }

    #[test]
    fn test_outpoint_bytes() {
        let outpoint = OutPoint::new([9u8; 32], 3);
        let bytes = outpoint.to_bytes();
        assert_eq!(&bytes[32..], &[3, 0, 0, 0]);
        assert_eq!(OutPoint::read(&mut Reader::new(&bytes)).unwrap(), outpoint);
    }
}
