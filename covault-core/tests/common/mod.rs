//! Shared fixtures for the integration tests: a deterministic 2-of-3
//! keychain with its primary private key, and mock collaborators for the
//! chain index, fee feed, and broadcaster.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bitcoin::bip32::{ExtendedPrivKey, ExtendedPubKey};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, Amount, Network, OutPoint, Transaction, Txid};

use covault_core::coin_selection::Utxo;
use covault_core::discovery::{ChainIndexClient, IndexError};
use covault_core::fee_estimation::{FeeRate, FeeRateError, FeeRateProvider, FeeStrategy};
use covault_core::keys::Keychain;
use covault_core::types::{SensitiveString, WalletMode};
use covault_core::vault;
use covault_core::wallet::{Broadcaster, BroadcastError, Wallet};

pub const TEST_PASSPHRASE: &str = "integration test passphrase";

pub fn primary_xprv() -> ExtendedPrivKey {
    ExtendedPrivKey::new_master(Network::Regtest, b"primary wallet seed bytes 000000").unwrap()
}

pub fn test_keychain() -> Keychain {
    let secp = Secp256k1::new();
    let xpub = |seed: &[u8]| {
        let xprv = ExtendedPrivKey::new_master(Network::Regtest, seed).unwrap();
        ExtendedPubKey::from_priv(&secp, &xprv)
    };
    let primary = ExtendedPubKey::from_priv(&secp, &primary_xprv());
    let mut cosigners = BTreeMap::new();
    cosigners.insert(0, xpub(b"cosigner zero seed bytes 00000000"));
    cosigners.insert(1, xpub(b"cosigner one seed bytes 000000000"));
    Keychain::new(
        Network::Regtest,
        primary,
        xpub(b"backup wallet seed bytes 00000000"),
        cosigners,
    )
    .unwrap()
}

/// In-memory chain index. Funding is keyed by address; usage follows from
/// having ever been funded.
pub struct MockIndex {
    utxos: Mutex<Vec<Utxo>>,
    used: Mutex<HashMap<Address, bool>>,
    next_txid: AtomicU32,
}

impl MockIndex {
    pub fn new() -> Self {
        Self {
            utxos: Mutex::new(Vec::new()),
            used: Mutex::new(HashMap::new()),
            next_txid: AtomicU32::new(1),
        }
    }

    pub fn fund(&self, address: Address, sats: u64, confirmations: u32) -> OutPoint {
        let n = self.next_txid.fetch_add(1, Ordering::SeqCst);
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&n.to_le_bytes());
        let outpoint = OutPoint::new(Txid::from_byte_array(bytes), 0);
        self.used.lock().unwrap().insert(address.clone(), true);
        self.utxos.lock().unwrap().push(Utxo::new(
            outpoint,
            Amount::from_sat(sats),
            address,
            confirmations,
        ));
        outpoint
    }

    pub fn spend(&self, outpoint: OutPoint) {
        self.utxos.lock().unwrap().retain(|u| u.outpoint != outpoint);
    }
}

impl ChainIndexClient for MockIndex {
    fn utxos(&self, addresses: &[Address]) -> Result<Vec<Utxo>, IndexError> {
        let utxos = self.utxos.lock().unwrap();
        Ok(utxos
            .iter()
            .filter(|u| addresses.contains(&u.address))
            .cloned()
            .collect())
    }

    fn address_used(&self, address: &Address) -> Result<bool, IndexError> {
        Ok(self.used.lock().unwrap().contains_key(address))
    }
}

/// Adjustable fee feed, so tests can move the fee market between calls.
pub struct MockFeed {
    optimal: AtomicU64,
    low: AtomicU64,
    high: AtomicU64,
}

impl Default for MockFeed {
    fn default() -> Self {
        Self {
            optimal: AtomicU64::new(5_000),
            low: AtomicU64::new(2_000),
            high: AtomicU64::new(12_000),
        }
    }
}

impl MockFeed {
    pub fn set_optimal(&self, rate: u64) {
        self.optimal.store(rate, Ordering::SeqCst);
    }

    pub fn set_low(&self, rate: u64) {
        self.low.store(rate, Ordering::SeqCst);
    }
}

impl FeeRateProvider for MockFeed {
    fn recommended_rate(&self, strategy: FeeStrategy) -> Result<FeeRate, FeeRateError> {
        let rate = match strategy {
            FeeStrategy::LowPriority => self.low.load(Ordering::SeqCst),
            FeeStrategy::HighPriority => self.high.load(Ordering::SeqCst),
            _ => self.optimal.load(Ordering::SeqCst),
        };
        Ok(FeeRate::from_sat_per_kvb(rate))
    }
}

/// Broadcaster that records transactions and can be told to reject.
pub struct MockBroadcaster {
    pub sent: Mutex<Vec<Transaction>>,
    reject_input_spent: AtomicUsize,
}

impl MockBroadcaster {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            reject_input_spent: AtomicUsize::new(0),
        }
    }

    pub fn reject_next_as_spent(&self) {
        self.reject_input_spent.store(1, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Broadcaster for MockBroadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, BroadcastError> {
        let pending = self.reject_input_spent.load(Ordering::SeqCst);
        if pending > 0 {
            self.reject_input_spent.store(pending - 1, Ordering::SeqCst);
            return Err(BroadcastError::InputSpent);
        }
        self.sent.lock().unwrap().push(tx.clone());
        Ok(tx.txid())
    }
}

pub struct TestHarness {
    pub wallet: Wallet,
    pub index: Arc<MockIndex>,
    pub feed: Arc<MockFeed>,
    pub broadcaster: Arc<MockBroadcaster>,
}

pub fn build_wallet(mode: WalletMode) -> TestHarness {
    let keychain = Arc::new(test_keychain());
    let blob = vault::encrypt_key(
        &primary_xprv(),
        &SensitiveString::new(TEST_PASSPHRASE),
    )
    .unwrap();
    let index = Arc::new(MockIndex::new());
    let feed = Arc::new(MockFeed::default());
    let broadcaster = Arc::new(MockBroadcaster::new());
    let wallet = Wallet::new(
        "test-wallet",
        keychain,
        mode,
        0,
        blob,
        index.clone(),
        feed.clone(),
        broadcaster.clone(),
    )
    .unwrap();
    TestHarness {
        wallet,
        index,
        feed,
        broadcaster,
    }
}
