//! Transaction assembly and signing hooks
//!
//! Turns a coin selection into an unsigned [`bitcoin::Transaction`] plus the
//! per-input metadata a signer needs: the funding value, the wallet scripts,
//! and the derivation path that produced the spent address. Balance is
//! verified structurally before anything is signed, and sighash computation
//! follows the wallet's script mode (legacy P2SH or P2SH-P2WSH).

use bitcoin::absolute::LockTime;
use bitcoin::blockdata::opcodes::all::OP_PUSHBYTES_0;
use bitcoin::blockdata::script::{Builder, PushBytesBuf};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Amount, OutPoint, Sequence, Transaction, TxIn, TxOut, Witness,
};
use log::debug;

use crate::coin_selection::Selection;
use crate::error::{WalletError, WalletResult};
use crate::registry::{PathRegistry, RegisteredPath};
use crate::script::WalletScript;
use crate::types::WalletMode;

/// One input of a candidate transaction with everything a signer needs.
#[derive(Debug, Clone)]
pub struct SignableInput {
    /// Position within the transaction's input list.
    pub index: usize,
    /// The outpoint being spent.
    pub outpoint: OutPoint,
    /// Value of the spent output, required for segwit sighashes.
    pub value: Amount,
    /// Scripts for the spent address.
    pub script: WalletScript,
    /// Derivation path and key index backing the spent address.
    pub path: RegisteredPath,
}

/// An assembled, not-yet-signed transaction.
#[derive(Debug, Clone)]
pub struct CandidateTransaction {
    pub tx: Transaction,
    pub inputs: Vec<SignableInput>,
    pub fee: Amount,
    pub change_position: Option<usize>,
}

impl CandidateTransaction {
    /// Sighash for input `index` under the wallet's script mode.
    ///
    /// Legacy inputs commit to the redeem script with the pre-segwit
    /// algorithm; segwit inputs commit to the witness script and the funding
    /// value per BIP 143.
    pub fn sighash(&self, index: usize) -> WalletResult<[u8; 32]> {
        use bitcoin::hashes::Hash;

        let input = self
            .inputs
            .get(index)
            .ok_or_else(|| WalletError::Signer(format!("no input at index {index}")))?;
        let cache = SighashCache::new(&self.tx);
        match input.script.mode {
            WalletMode::Legacy => {
                let hash = cache
                    .legacy_signature_hash(
                        index,
                        &input.script.multisig,
                        EcdsaSighashType::All.to_u32(),
                    )
                    .map_err(|e| WalletError::Signer(e.to_string()))?;
                Ok(hash.to_byte_array())
            }
            WalletMode::Segwit => {
                let mut cache = cache;
                let hash = cache
                    .segwit_signature_hash(
                        index,
                        &input.script.multisig,
                        input.value.to_sat(),
                        EcdsaSighashType::All,
                    )
                    .map_err(|e| WalletError::Signer(e.to_string()))?;
                Ok(hash.to_byte_array())
            }
        }
    }

    /// Attach a single DER signature to input `index`, producing the
    /// half-signed form the cosigner completes later.
    ///
    /// Legacy: `scriptSig = OP_0 <sig> <redeem_script>` (the leading OP_0
    /// absorbs the CHECKMULTISIG off-by-one). Segwit: the scriptSig pushes
    /// the P2WSH program and the witness stack carries an empty slot for the
    /// second signature.
    pub fn attach_half_signature(
        &mut self,
        index: usize,
        signature_der: &[u8],
    ) -> WalletResult<()> {
        let input = self
            .inputs
            .get(index)
            .ok_or_else(|| WalletError::Signer(format!("no input at index {index}")))?;

        let mut sig_with_hashtype = signature_der.to_vec();
        sig_with_hashtype.push(EcdsaSighashType::All.to_u32() as u8);
        let sig_push = PushBytesBuf::try_from(sig_with_hashtype)
            .map_err(|_| WalletError::Signer("signature exceeds push limit".to_string()))?;

        match input.script.mode {
            WalletMode::Legacy => {
                let redeem_push = PushBytesBuf::try_from(input.script.redeem_script.to_bytes())
                    .map_err(|_| {
                        WalletError::Signer("redeem script exceeds push limit".to_string())
                    })?;
                self.tx.input[index].script_sig = Builder::new()
                    .push_opcode(OP_PUSHBYTES_0)
                    .push_slice(&sig_push)
                    .push_slice(&redeem_push)
                    .into_script();
            }
            WalletMode::Segwit => {
                let program_push = PushBytesBuf::try_from(input.script.redeem_script.to_bytes())
                    .map_err(|_| {
                        WalletError::Signer("witness program exceeds push limit".to_string())
                    })?;
                self.tx.input[index].script_sig =
                    Builder::new().push_slice(&program_push).into_script();
                let mut witness = Witness::new();
                witness.push(&[] as &[u8]);
                witness.push(sig_push.as_bytes());
                witness.push(input.script.multisig.as_bytes());
                self.tx.input[index].witness = witness;
            }
        }
        Ok(())
    }
}

/// Builds candidate transactions from selections.
pub struct TransactionAssembler<'a> {
    registry: &'a PathRegistry,
}

impl<'a> TransactionAssembler<'a> {
    pub fn new(registry: &'a PathRegistry) -> Self {
        Self { registry }
    }

    /// Assemble `selection` into an unsigned transaction.
    ///
    /// Rejects duplicate inputs, zero-value outputs, and any selection whose
    /// inputs do not equal outputs plus fee to the satoshi.
    pub fn assemble(&self, selection: &Selection) -> WalletResult<CandidateTransaction> {
        if selection.inputs.is_empty() {
            return Err(WalletError::ImbalancedTransaction(
                "no inputs selected".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for utxo in &selection.inputs {
            if !seen.insert(utxo.outpoint) {
                return Err(WalletError::ImbalancedTransaction(format!(
                    "duplicate input {}",
                    utxo.outpoint
                )));
            }
        }
        if let Some(zero) = selection.outputs.iter().find(|o| o.amount.to_sat() == 0) {
            return Err(WalletError::ImbalancedTransaction(format!(
                "zero-value output to {}",
                zero.address
            )));
        }
        if selection.input_total() != selection.output_total() + selection.fee {
            return Err(WalletError::ImbalancedTransaction(format!(
                "inputs {} != outputs {} + fee {}",
                selection.input_total(),
                selection.output_total(),
                selection.fee
            )));
        }

        let mut tx_inputs = Vec::with_capacity(selection.inputs.len());
        let mut signables = Vec::with_capacity(selection.inputs.len());
        for (idx, utxo) in selection.inputs.iter().enumerate() {
            let registered = self.registry.resolve(&utxo.address)?;
            let script = self.registry.script_for(&registered)?;
            tx_inputs.push(TxIn {
                previous_output: utxo.outpoint,
                script_sig: Default::default(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            });
            signables.push(SignableInput {
                index: idx,
                outpoint: utxo.outpoint,
                value: utxo.amount,
                script,
                path: registered,
            });
        }

        let tx_outputs = selection
            .outputs
            .iter()
            .map(|o| TxOut {
                value: o.amount.to_sat(),
                script_pubkey: o.address.script_pubkey(),
            })
            .collect();

        let tx = Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: tx_inputs,
            output: tx_outputs,
        };

        debug!(
            "assembled tx: {} inputs, {} outputs, fee {} sat",
            tx.input.len(),
            tx.output.len(),
            selection.fee.to_sat()
        );

        Ok(CandidateTransaction {
            tx,
            inputs: signables,
            fee: selection.fee,
            change_position: selection.change_position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin_selection::Utxo;
    use crate::keys::Keychain;
    use crate::types::{Chain, OutputRequest};
    use bitcoin::bip32::{ExtendedPrivKey, ExtendedPubKey};
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::{Network, Txid};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn test_registry(mode: WalletMode) -> PathRegistry {
        let secp = Secp256k1::new();
        let xpub = |seed: &[u8]| {
            let xprv = ExtendedPrivKey::new_master(Network::Regtest, seed).unwrap();
            ExtendedPubKey::from_priv(&secp, &xprv)
        };
        let mut cosigners = BTreeMap::new();
        cosigners.insert(0, xpub(b"cosigner seed 00"));
        let keychain =
            Keychain::new(Network::Regtest, xpub(b"primary seed 0000"), xpub(b"backup seed 00000"), cosigners)
                .unwrap();
        PathRegistry::new(Arc::new(keychain), mode, 0).unwrap()
    }

    fn funded_utxo(registry: &PathRegistry, n: u8, sats: u64) -> Utxo {
        let (_, address) = registry.next_address(Chain::External).unwrap();
        Utxo::new(
            OutPoint::new(Txid::from_byte_array([n; 32]), 0),
            Amount::from_sat(sats),
            address,
            6,
        )
    }

    fn selection_for(registry: &PathRegistry, input_sats: u64, out_sats: u64, fee: u64) -> Selection {
        let utxo = funded_utxo(registry, 1, input_sats);
        let (_, dest) = registry.next_address(Chain::External).unwrap();
        Selection {
            inputs: vec![utxo],
            outputs: vec![OutputRequest::new(dest, Amount::from_sat(out_sats)).unwrap()],
            fee: Amount::from_sat(fee),
            change_position: None,
            estimated_vsize: 340,
        }
    }

    #[test]
    fn assembles_balanced_transaction() {
        let registry = test_registry(WalletMode::Legacy);
        let selection = selection_for(&registry, 100_000, 95_000, 5_000);
        let candidate = TransactionAssembler::new(&registry)
            .assemble(&selection)
            .unwrap();
        assert_eq!(candidate.tx.input.len(), 1);
        assert_eq!(candidate.tx.output.len(), 1);
        assert_eq!(candidate.tx.output[0].value, 95_000);
        assert_eq!(candidate.tx.version, 2);
        assert_eq!(candidate.fee.to_sat(), 5_000);
        assert!(candidate.tx.input[0].sequence.is_rbf());
    }

    #[test]
    fn rejects_imbalanced_selection() {
        let registry = test_registry(WalletMode::Legacy);
        let selection = selection_for(&registry, 100_000, 95_000, 4_000);
        let err = TransactionAssembler::new(&registry)
            .assemble(&selection)
            .unwrap_err();
        assert!(matches!(err, WalletError::ImbalancedTransaction(_)));
    }

    #[test]
    fn rejects_duplicate_inputs() {
        let registry = test_registry(WalletMode::Legacy);
        let mut selection = selection_for(&registry, 100_000, 195_000, 5_000);
        let dup = selection.inputs[0].clone();
        selection.inputs.push(dup);
        let err = TransactionAssembler::new(&registry)
            .assemble(&selection)
            .unwrap_err();
        assert!(matches!(err, WalletError::ImbalancedTransaction(_)));
    }

    #[test]
    fn rejects_unknown_input_address() {
        let registry = test_registry(WalletMode::Legacy);
        // Same structure, different keys: its addresses are unknown here.
        let foreign = {
            let secp = Secp256k1::new();
            let xprv =
                ExtendedPrivKey::new_master(Network::Regtest, b"different seed 0").unwrap();
            let xpub = ExtendedPubKey::from_priv(&secp, &xprv);
            let mut cosigners = BTreeMap::new();
            cosigners.insert(0, xpub);
            let keychain = Keychain::new(Network::Regtest, xpub, xpub, cosigners).unwrap();
            PathRegistry::new(Arc::new(keychain), WalletMode::Legacy, 0).unwrap()
        };
        let mut selection = selection_for(&registry, 100_000, 95_000, 5_000);
        let (_, foreign_addr) = foreign.next_address(Chain::External).unwrap();
        selection.inputs[0].address = foreign_addr;
        let err = TransactionAssembler::new(&registry)
            .assemble(&selection)
            .unwrap_err();
        assert!(matches!(err, WalletError::UnknownAddress(_)));
    }

    #[test]
    fn legacy_half_signature_shape() {
        let registry = test_registry(WalletMode::Legacy);
        let selection = selection_for(&registry, 100_000, 95_000, 5_000);
        let mut candidate = TransactionAssembler::new(&registry)
            .assemble(&selection)
            .unwrap();
        let sighash = candidate.sighash(0).unwrap();
        assert_ne!(sighash, [0u8; 32]);

        // A structurally plausible DER signature is enough for shape checks.
        let fake_sig = vec![0x30u8; 71];
        candidate.attach_half_signature(0, &fake_sig).unwrap();
        let script_sig = &candidate.tx.input[0].script_sig;
        assert!(!script_sig.is_empty());
        // OP_0 leads the scriptSig.
        assert_eq!(script_sig.as_bytes()[0], 0x00);
        assert!(candidate.tx.input[0].witness.is_empty());
    }

    #[test]
    fn segwit_half_signature_shape() {
        let registry = test_registry(WalletMode::Segwit);
        let selection = selection_for(&registry, 100_000, 95_000, 5_000);
        let mut candidate = TransactionAssembler::new(&registry)
            .assemble(&selection)
            .unwrap();
        let fake_sig = vec![0x30u8; 71];
        candidate.attach_half_signature(0, &fake_sig).unwrap();
        let witness = &candidate.tx.input[0].witness;
        assert_eq!(witness.len(), 3);
        assert_eq!(witness.iter().next().unwrap().len(), 0);
        // scriptSig is the single push of the 34-byte P2WSH program.
        assert_eq!(candidate.tx.input[0].script_sig.len(), 35);
    }
}
