//! The wallet orchestrator
//!
//! Ties the pieces together: the path registry for addresses and scripts,
//! the fee estimator, coin selection, transaction assembly, the lease table,
//! and the unlock session holding the decrypted primary key. Every spending
//! operation checks the lock state first; read operations (addresses,
//! balances, discovery) work on a locked wallet.
//!
//! The payment path is: check unlock, resolve the fee rate, snapshot
//! spendable UTXOs (leased outpoints excluded), pre-allocate a change
//! address, select coins, lease the chosen outpoints, assemble, half-sign
//! with the primary key, broadcast. Leases are released on every exit path;
//! a broadcast rejection for an already-spent input is reported as a
//! selection conflict so callers retry with a fresh snapshot.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use bitcoin::bip32::{ExtendedPrivKey, ExtendedPubKey};
use bitcoin::secp256k1::Message;
use bitcoin::{Address, Amount, Network, Transaction, Txid};
use log::{debug, info, warn};
use thiserror::Error;

use crate::coin_selection::{CoinSelector, LeaseTable, Selection, SelectionOptions, Utxo};
use crate::discovery::{
    CancelToken, ChainIndexClient, DiscoveryEngine, DiscoveryOptions, DiscoveryReport,
};
use crate::error::{WalletError, WalletResult};
use crate::fee_estimation::{defaults, FeeEstimator, FeeRate, FeeRateProvider, FeeStrategy};
use crate::keys::{Keychain, SECP};
use crate::registry::{PathRegistry, RegisteredPath};
use crate::script::WalletScript;
use crate::tx_builder::{CandidateTransaction, TransactionAssembler};
use crate::types::{
    normalize_output_strings, Chain, OutputRequest, SensitiveString, WalletMode,
};
use crate::vault::{self, EncryptedKey};

/// Errors surfaced by a broadcast backend.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// An input of the transaction was spent by someone else first.
    #[error("transaction rejected: input already spent")]
    InputSpent,

    /// The backend rejected the transaction for another reason.
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// The backend could not be reached.
    #[error("broadcast failed: {0}")]
    Unreachable(String),
}

/// Submits finalized transactions to the network.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, BroadcastError>;
}

/// Produces one DER-encoded signature for an input of a candidate.
pub trait TransactionSigner {
    fn sign_input(&self, candidate: &CandidateTransaction, index: usize) -> WalletResult<Vec<u8>>;
}

/// Signs with the primary extended private key from the unlock session,
/// deriving the per-input child key along the registered path.
struct PrimaryKeySigner<'a> {
    xprv: &'a ExtendedPrivKey,
}

impl TransactionSigner for PrimaryKeySigner<'_> {
    fn sign_input(&self, candidate: &CandidateTransaction, index: usize) -> WalletResult<Vec<u8>> {
        let input = candidate
            .inputs
            .get(index)
            .ok_or_else(|| WalletError::Signer(format!("no input at index {index}")))?;
        let suffix = input.path.path.to_derivation_path()?;
        let child = self.xprv.derive_priv(&SECP, &suffix)?;
        let sighash = candidate.sighash(index)?;
        let message =
            Message::from_slice(&sighash).map_err(|e| WalletError::Signer(e.to_string()))?;
        let signature = SECP.sign_ecdsa(&message, &child.private_key);
        Ok(signature.serialize_der().to_vec())
    }
}

/// What a wallet unlock can present.
pub enum UnlockCredential {
    /// The primary extended private key directly.
    PrimaryKey(ExtendedPrivKey),
    /// The passphrase protecting the stored primary key.
    Passphrase(SensitiveString),
}

impl fmt::Debug for UnlockCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockCredential::PrimaryKey(_) => f.write_str("UnlockCredential::PrimaryKey(..)"),
            UnlockCredential::Passphrase(_) => f.write_str("UnlockCredential::Passphrase(..)"),
        }
    }
}

/// Decrypted key material held while the wallet is unlocked.
struct UnlockedSession {
    xprv: ExtendedPrivKey,
}

impl fmt::Debug for UnlockedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnlockedSession { .. }")
    }
}

/// Spendable vs pending funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletBalance {
    pub confirmed: Amount,
    pub unconfirmed: Amount,
}

impl WalletBalance {
    pub fn total(&self) -> Amount {
        self.confirmed + self.unconfirmed
    }
}

/// A 2-of-3 multisig HD wallet.
pub struct Wallet {
    id: String,
    network: Network,
    mode: WalletMode,
    keychain: Arc<Keychain>,
    registry: PathRegistry,
    selector: CoinSelector,
    vault_blob: Mutex<EncryptedKey>,
    fee_estimator: FeeEstimator<Arc<dyn FeeRateProvider>>,
    index: Arc<dyn ChainIndexClient>,
    broadcaster: Arc<dyn Broadcaster>,
    leases: LeaseTable,
    session: RwLock<Option<UnlockedSession>>,
}

impl Wallet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        keychain: Arc<Keychain>,
        mode: WalletMode,
        initial_key_index: u32,
        encrypted_primary: EncryptedKey,
        index: Arc<dyn ChainIndexClient>,
        fee_provider: Arc<dyn FeeRateProvider>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> WalletResult<Self> {
        let network = keychain.network();
        let registry = PathRegistry::new(Arc::clone(&keychain), mode, initial_key_index)?;
        Ok(Self {
            id: id.into(),
            network,
            mode,
            keychain,
            registry,
            selector: CoinSelector::new(mode, network),
            vault_blob: Mutex::new(encrypted_primary),
            fee_estimator: FeeEstimator::new(fee_provider, network),
            index,
            broadcaster,
            leases: LeaseTable::default(),
            session: RwLock::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn mode(&self) -> WalletMode {
        self.mode
    }

    pub fn is_segwit(&self) -> bool {
        self.mode.is_segwit()
    }

    pub fn backup_key(&self) -> &ExtendedPubKey {
        self.keychain.backup()
    }

    /// The cosigner key for a key index, if one is registered.
    pub fn cosigner_key(&self, key_index: u32) -> Option<&ExtendedPubKey> {
        self.keychain.cosigner(key_index)
    }

    pub fn cosigner_keys(&self) -> Vec<(u32, ExtendedPubKey)> {
        self.keychain.cosigners().map(|(i, k)| (i, *k)).collect()
    }

    pub fn key_index(&self) -> u32 {
        self.registry.key_index().current()
    }

    // ---- lock state ----

    /// Unlock the wallet. The presented credential must resolve to the
    /// private counterpart of the keychain's primary public key.
    pub fn unlock(&self, credential: UnlockCredential) -> WalletResult<()> {
        let xprv = match credential {
            UnlockCredential::PrimaryKey(xprv) => xprv,
            UnlockCredential::Passphrase(passphrase) => {
                let blob = self
                    .vault_blob
                    .lock()
                    .expect("vault blob mutex poisoned")
                    .clone();
                vault::decrypt_key(&blob, &passphrase)?
            }
        };
        if xprv.network != self.network {
            return Err(WalletError::Authentication);
        }
        let xpub = ExtendedPubKey::from_priv(&SECP, &xprv);
        if &xpub != self.keychain.primary() {
            return Err(WalletError::Authentication);
        }
        *self.session.write().expect("session lock poisoned") = Some(UnlockedSession { xprv });
        info!("wallet {} unlocked", self.id);
        Ok(())
    }

    pub fn lock(&self) {
        *self.session.write().expect("session lock poisoned") = None;
        info!("wallet {} locked", self.id);
    }

    pub fn is_locked(&self) -> bool {
        self.session
            .read()
            .expect("session lock poisoned")
            .is_none()
    }

    fn require_unlocked(&self) -> WalletResult<ExtendedPrivKey> {
        self.session
            .read()
            .expect("session lock poisoned")
            .as_ref()
            .map(|s| s.xprv)
            .ok_or(WalletError::WalletLocked)
    }

    /// Re-encrypt the stored primary key under a new passphrase. Works on a
    /// locked wallet; the old passphrase authenticates the change.
    pub fn change_passphrase(
        &self,
        old: &SensitiveString,
        new: &SensitiveString,
    ) -> WalletResult<()> {
        let mut blob = self.vault_blob.lock().expect("vault blob mutex poisoned");
        *blob = vault::change_passphrase(&blob, old, new)?;
        info!("wallet {} passphrase changed", self.id);
        Ok(())
    }

    /// Shut the wallet down. With `force` false, in-flight transaction
    /// builds (live leases) and remaining funds block the close.
    pub fn close(&self, force: bool) -> WalletResult<()> {
        if !force {
            if !self.leases.is_empty() {
                return Err(WalletError::Validation(
                    "transactions are in flight; close with force to abandon them".to_string(),
                ));
            }
            let balance = self.balance()?;
            if balance.total().to_sat() > 0 {
                return Err(WalletError::Validation(format!(
                    "wallet still holds {} sat; sweep the funds or close with force",
                    balance.total().to_sat()
                )));
            }
        }
        self.lock();
        Ok(())
    }

    // ---- addresses and paths ----

    pub fn new_address(&self) -> WalletResult<Address> {
        Ok(self.registry.next_address(Chain::External)?.1)
    }

    pub fn new_change_address(&self) -> WalletResult<Address> {
        Ok(self.registry.next_address(Chain::Internal)?.1)
    }

    pub fn address_at(&self, chain: Chain, index: u32) -> WalletResult<Address> {
        self.registry.ensure_address(chain, index)
    }

    pub fn path_for_address(&self, address: &Address) -> WalletResult<RegisteredPath> {
        self.registry.resolve(address)
    }

    pub fn script_for_address(&self, address: &Address) -> WalletResult<WalletScript> {
        let registered = self.registry.resolve(address)?;
        self.registry.script_for(&registered)
    }

    pub fn redeem_script_for_address(&self, address: &Address) -> WalletResult<bitcoin::ScriptBuf> {
        self.registry.redeem_script_for(address)
    }

    /// Switch future allocations to a higher key index. Existing addresses
    /// keep their recorded index.
    pub fn upgrade_key_index(&self, requested: u32) -> WalletResult<()> {
        self.registry.key_index().upgrade(requested, &self.keychain)?;
        info!("wallet {} upgraded to key index {}", self.id, requested);
        Ok(())
    }

    // ---- funds ----

    pub fn balance(&self) -> WalletResult<WalletBalance> {
        let addresses = self.registry.all_addresses();
        let (confirmed, unconfirmed) =
            self.index.balance(&addresses).map_err(WalletError::from)?;
        Ok(WalletBalance {
            confirmed,
            unconfirmed,
        })
    }

    /// Current UTXOs over all issued addresses, minus leased outpoints.
    pub fn spendable_utxos(&self) -> WalletResult<Vec<Utxo>> {
        let addresses = self.registry.all_addresses();
        let mut utxos = self.index.utxos(&addresses).map_err(WalletError::from)?;
        let leased = self.leases.leased_outpoints();
        utxos.retain(|u| !leased.contains(&u.outpoint));
        Ok(utxos)
    }

    /// Run gap-limited discovery over both chains.
    pub fn discover(
        &self,
        options: DiscoveryOptions,
        cancel: &CancelToken,
    ) -> WalletResult<DiscoveryReport> {
        DiscoveryEngine::new(&self.registry, self.index.as_ref(), options).run(cancel)
    }

    // ---- fees ----

    pub fn optimal_fee_per_kb(&self) -> WalletResult<FeeRate> {
        self.fee_estimator.clear_cache();
        self.fee_estimator.rate(FeeStrategy::Optimal)
    }

    pub fn low_priority_fee_per_kb(&self) -> WalletResult<FeeRate> {
        self.fee_estimator.clear_cache();
        self.fee_estimator.rate(FeeStrategy::LowPriority)
    }

    /// The cache only deduplicates feed hits within one call cycle, so each
    /// cycle starts from a cleared cache and sees current feed rates.
    fn resolve_rate(&self, strategy: FeeStrategy) -> WalletResult<(FeeRate, Option<Amount>)> {
        match strategy {
            FeeStrategy::ForceFee(amount) => {
                Ok((defaults::min_relay_rate(self.network), Some(amount)))
            }
            other => {
                self.fee_estimator.clear_cache();
                Ok((self.fee_estimator.rate(other)?, None))
            }
        }
    }

    /// Largest single-output spend currently possible.
    pub fn max_spendable(&self, strategy: FeeStrategy) -> WalletResult<Amount> {
        let (rate, _) = self.resolve_rate(strategy)?;
        let utxos = self.spendable_utxos()?;
        Ok(self.selector.max_spendable(&utxos, rate, false))
    }

    // ---- transaction construction ----

    /// Run coin selection for `outputs` without building or leasing
    /// anything. A change address is pre-allocated; if the selection ends up
    /// without change the address stays registered but never funded, which
    /// is harmless.
    pub fn coin_selection(
        &self,
        outputs: &[OutputRequest],
        strategy: FeeStrategy,
        mut options: SelectionOptions,
    ) -> WalletResult<Selection> {
        let (rate, forced) = self.resolve_rate(strategy)?;
        if forced.is_some() {
            options.force_fee = forced;
        }
        let utxos = self.spendable_utxos()?;
        let change_address = self.new_change_address()?;
        self.selector
            .select(&utxos, outputs, rate, &change_address, &options)
    }

    /// Assemble a selection into an unsigned candidate transaction.
    pub fn build_tx(&self, selection: &Selection) -> WalletResult<CandidateTransaction> {
        TransactionAssembler::new(&self.registry).assemble(selection)
    }

    /// Select, lease, assemble, half-sign, and broadcast in one step.
    pub fn pay(
        &self,
        outputs: &[OutputRequest],
        strategy: FeeStrategy,
        options: SelectionOptions,
    ) -> WalletResult<Txid> {
        let xprv = self.require_unlocked()?;
        let selection = self.coin_selection(outputs, strategy, options)?;
        let outpoints: Vec<_> = selection.inputs.iter().map(|u| u.outpoint).collect();
        let token = self.leases.acquire(&outpoints)?;

        let result = (|| {
            let mut candidate = self.build_tx(&selection)?;
            self.half_sign(&xprv, &mut candidate)?;
            self.submit(&candidate.tx)
        })();

        // Broadcast consumed the outpoints on success; on failure they go
        // back into the pool either way.
        self.leases.release(token);
        result
    }

    /// Pay outputs given as (address string, satoshis) pairs.
    ///
    /// This is the outer boundary for callers holding unparsed addresses:
    /// each string is parsed, checked against the wallet's network, and
    /// normalized into the ordered output list before selection starts.
    pub fn pay_to(
        &self,
        pairs: Vec<(String, u64)>,
        strategy: FeeStrategy,
        options: SelectionOptions,
    ) -> WalletResult<Txid> {
        let outputs = normalize_output_strings(pairs, self.network)?;
        self.pay(&outputs, strategy, options)
    }

    /// Sign and broadcast an externally assembled candidate. The inputs are
    /// leased for the duration of the attempt.
    pub fn send_tx(&self, mut candidate: CandidateTransaction) -> WalletResult<Txid> {
        let xprv = self.require_unlocked()?;
        let outpoints: Vec<_> = candidate.inputs.iter().map(|i| i.outpoint).collect();
        let token = self.leases.acquire(&outpoints)?;
        let result = (|| {
            self.half_sign(&xprv, &mut candidate)?;
            self.submit(&candidate.tx)
        })();
        self.leases.release(token);
        result
    }

    fn half_sign(
        &self,
        xprv: &ExtendedPrivKey,
        candidate: &mut CandidateTransaction,
    ) -> WalletResult<()> {
        let signer = PrimaryKeySigner { xprv };
        for index in 0..candidate.inputs.len() {
            let signature = signer.sign_input(candidate, index)?;
            candidate.attach_half_signature(index, &signature)?;
        }
        debug!(
            "half-signed {} inputs of candidate transaction",
            candidate.inputs.len()
        );
        Ok(())
    }

    fn submit(&self, tx: &Transaction) -> WalletResult<Txid> {
        match self.broadcaster.broadcast(tx) {
            Ok(txid) => {
                info!("wallet {} broadcast {}", self.id, txid);
                Ok(txid)
            }
            Err(BroadcastError::InputSpent) => {
                warn!("broadcast rejected: input spent under us");
                Err(WalletError::CoinSelectionConflict(
                    "an input was spent before broadcast; reselect and retry".to_string(),
                ))
            }
            Err(err) => Err(WalletError::Broadcast(err.to_string())),
        }
    }
}
