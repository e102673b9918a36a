//! Derives addresses and ownership from raw scripts

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::address::{Address, AddressType};
use crate::core::script::data_pushes;
use crate::core::transaction::Transaction;
use crate::crypto::hash160;
use crate::network::params::Network;
use crate::wallet::KeyProvider;

pub trait TransactionExtractor: Send + Sync {
    fn extract(&self, tx: &mut Transaction);
}

/// Fills in output addresses, input key hashes taken from the signing
/// public key, and the `is_mine` flags for keys the wallet holds
pub struct KeyExtractor {
    network: Network,
    keys: Arc<dyn KeyProvider>,
}

impl KeyExtractor {
    pub fn new(network: Network, keys: Arc<dyn KeyProvider>) -> Self {
        Self { network, keys }
    }
}

impl TransactionExtractor for KeyExtractor {
    fn extract(&self, tx: &mut Transaction) {
        let own: HashSet<Vec<u8>> = self
            .keys
            .public_keys()
            .into_iter()
            .map(|key| key.public_key_hash)
            .collect();

        for output in tx.outputs.iter_mut() {
            if output.address.is_none() {
                output.address = Address::from_output_script(&output.lock_script, self.network)
                    .map(|address| address.to_string());
            }
            if let Some(key_hash) = &output.key_hash {
                if own.contains(key_hash) {
                    output.is_mine = true;
                    self.keys.mark_used(key_hash);
                }
            }
        }

        for input in tx.inputs.iter_mut() {
            if input.key_hash.is_some() {
                continue;
            }
            let public_key = data_pushes(&input.sig_script)
                .last()
                .copied()
                .filter(|push| push.len() == 33 || push.len() == 65);
            if let Some(public_key) = public_key {
                let key_hash = hash160(public_key);
                input.address =
                    Some(Address::new(AddressType::P2PKH, key_hash.clone(), self.network).to_string());
                input.key_hash = Some(key_hash);
            }
        }

        let spends_own = tx
            .inputs
            .iter()
            .filter_map(|input| input.key_hash.as_ref())
            .any(|key_hash| own.contains(key_hash));
        if spends_own || tx.outputs.iter().any(|output| output.is_mine) {
            tx.is_mine = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::ScriptBuilder;
    use crate::core::transaction::{OutPoint, TransactionInput, TransactionOutput};
    use crate::wallet::KeyChain;

    fn payment_to(address: &Address, value: u64, index: u32) -> TransactionOutput {
        TransactionOutput::new(
            value,
            ScriptBuilder::new().locking_script(address).unwrap(),
            index,
        )
    }

    #[test]
    fn test_marks_outputs_paying_wallet_keys() {
        let keys = Arc::new(KeyChain::in_memory(2).unwrap());
        let receive = keys.receive_public_key().unwrap();
        let stranger =
            Address::parse("2MyQWMrsLsqAMSUeusduAzN6pWuH2V27ykE", Network::Testnet).unwrap();

        let mut tx = Transaction::new(
            1,
            vec![TransactionInput::new(OutPoint::new([1u8; 32], 0), vec![])],
            vec![
                payment_to(&receive.address(Network::Testnet), 5_000, 0),
                payment_to(&stranger, 7_000, 1),
            ],
            0,
        );

        KeyExtractor::new(Network::Testnet, keys.clone()).extract(&mut tx);

        assert!(tx.is_mine);
        assert!(tx.outputs[0].is_mine);
        assert!(!tx.outputs[1].is_mine);
        assert_eq!(
            tx.outputs[0].address,
            Some(receive.address(Network::Testnet).to_string())
        );
        assert_eq!(
            tx.outputs[1].address.as_deref(),
            Some("2MyQWMrsLsqAMSUeusduAzN6pWuH2V27ykE")
        );
        assert_ne!(keys.receive_public_key().unwrap(), receive);
    }

    #[test]
    fn test_input_key_hash_from_sig_script() {
        let keys = Arc::new(KeyChain::in_memory(1).unwrap());
        let own = keys.receive_public_key().unwrap();
        let sig_script = ScriptBuilder::new().unlocking_script(&[vec![0x30; 71], own.public_key.clone()]);

        let mut tx = Transaction::new(
            1,
            vec![TransactionInput::new(OutPoint::new([2u8; 32], 3), sig_script)],
            vec![TransactionOutput::new(1, vec![0x6a], 0)],
            0,
        );
        KeyExtractor::new(Network::Testnet, keys).extract(&mut tx);

        assert_eq!(tx.inputs[0].key_hash.as_ref(), Some(&own.public_key_hash));
        assert_eq!(
            tx.inputs[0].address,
            Some(own.address(Network::Testnet).to_string())
        );
        assert!(tx.is_mine);
    }

    #[test]
    fn test_foreign_transaction_is_not_mine() {
        let keys = Arc::new(KeyChain::in_memory(1).unwrap());
        let mut tx = Transaction::new(
            1,
            vec![TransactionInput::new(OutPoint::new([2u8; 32], 0), vec![0x01, 0x02])],
            vec![TransactionOutput::new(1, vec![0x51], 0)],
            0,
        );
        KeyExtractor::new(Network::Testnet, keys).extract(&mut tx);

        assert!(!tx.is_mine);
        assert!(tx.inputs[0].key_hash.is_none());
        assert!(tx.outputs[0].address.is_none());
    }
}
