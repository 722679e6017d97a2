//! Address/path registry and cosigner key-index management
//!
//! The registry owns the wallet's chain/index counters and the address→path
//! mapping built up as addresses are generated. Allocation is linearizable:
//! the per-chain counter is advanced and the mapping registered under one
//! lock, so concurrent `next_address` calls never hand out the same index
//! twice. Allocation is also append-only: indices are never reused, even if
//! the resulting address is never funded.
//!
//! Scripts are derived, never stored: the registry records which key index
//! and path an address was allocated under and re-derives the script on
//! demand, so the mapping stays valid across cosigner key rotations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use bitcoin::{Address, ScriptBuf};
use log::{debug, info};

use crate::error::{WalletError, WalletResult};
use crate::keys::{Keychain, WalletPath};
use crate::script::{build_script_for_trio, WalletScript};
use crate::types::{Chain, WalletMode};

/// The allocation record for one address: the cosigner key index active at
/// allocation time plus the chain/index pair.
///
/// The embedded key index is what keeps old addresses resolvable after a
/// key-index upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredPath {
    pub key_index: u32,
    pub path: WalletPath,
}

/// Tracks the active cosigner key index and validates upgrades.
///
/// Upgrading is a one-way forward transition: the new index must be greater
/// than the current one and must have a registered cosigner key. Old indices
/// stay valid for already-issued addresses.
#[derive(Debug)]
pub struct KeyIndexManager {
    active: Mutex<u32>,
}

impl KeyIndexManager {
    pub fn new(initial: u32) -> Self {
        Self {
            active: Mutex::new(initial),
        }
    }

    /// The key index new allocations will use.
    pub fn current(&self) -> u32 {
        *self.active.lock().expect("key index mutex poisoned")
    }

    /// Move to a higher key index whose cosigner key is registered.
    ///
    /// On failure the current index is left untouched.
    pub fn upgrade(&self, requested: u32, keychain: &Keychain) -> WalletResult<()> {
        let mut active = self.active.lock().expect("key index mutex poisoned");
        if requested <= *active {
            return Err(WalletError::InvalidKeyIndex {
                current: *active,
                requested,
            });
        }
        if !keychain.has_cosigner(requested) {
            return Err(WalletError::InvalidKeyIndex {
                current: *active,
                requested,
            });
        }
        info!("upgrading cosigner key index {} -> {}", *active, requested);
        *active = requested;
        Ok(())
    }
}

/// Per-chain index allocator plus bidirectional address/path mapping.
pub struct PathRegistry {
    keychain: Arc<Keychain>,
    mode: WalletMode,
    key_index: KeyIndexManager,
    /// Next unallocated index per chain, indexed by `Chain::index()`.
    counters: [Mutex<u32>; 2],
    by_address: RwLock<HashMap<Address, RegisteredPath>>,
    by_path: RwLock<HashMap<(Chain, u32), Address>>,
}

impl PathRegistry {
    pub fn new(
        keychain: Arc<Keychain>,
        mode: WalletMode,
        initial_key_index: u32,
    ) -> WalletResult<Self> {
        if !keychain.has_cosigner(initial_key_index) {
            return Err(WalletError::InvalidKeyIndex {
                current: initial_key_index,
                requested: initial_key_index,
            });
        }
        Ok(Self {
            keychain,
            mode,
            key_index: KeyIndexManager::new(initial_key_index),
            counters: [Mutex::new(0), Mutex::new(0)],
            by_address: RwLock::new(HashMap::new()),
            by_path: RwLock::new(HashMap::new()),
        })
    }

    pub fn key_index(&self) -> &KeyIndexManager {
        &self.key_index
    }

    pub fn mode(&self) -> WalletMode {
        self.mode
    }

    /// Allocate the next index on a chain, derive its script under the
    /// current key index, register the mapping, and return it.
    ///
    /// The counter is advanced and both maps are populated while the chain
    /// lock is held, which is what makes allocation linearizable.
    pub fn next_address(&self, chain: Chain) -> WalletResult<(RegisteredPath, Address)> {
        let mut next = self.counters[chain.index() as usize]
            .lock()
            .expect("chain counter mutex poisoned");
        let index = *next;
        let key_index = self.key_index.current();
        let path = WalletPath::new(chain, index);
        let script = self.derive_script(key_index, &path)?;
        let registered = RegisteredPath { key_index, path };

        self.by_address
            .write()
            .expect("address map lock poisoned")
            .insert(script.address.clone(), registered);
        self.by_path
            .write()
            .expect("path map lock poisoned")
            .insert((chain, index), script.address.clone());
        *next = index + 1;

        debug!("allocated {} address at {}", chain, path);
        Ok((registered, script.address))
    }

    /// The address at (chain, index), allocating sequentially up to it if it
    /// has not been issued yet.
    ///
    /// Idempotent: an already-registered index is returned as-is, never
    /// re-derived differently. Discovery resume relies on this.
    pub fn ensure_address(&self, chain: Chain, index: u32) -> WalletResult<Address> {
        loop {
            if let Some(address) = self
                .by_path
                .read()
                .expect("path map lock poisoned")
                .get(&(chain, index))
            {
                return Ok(address.clone());
            }
            let (registered, address) = self.next_address(chain)?;
            if registered.path.index == index {
                return Ok(address);
            }
            // A concurrent allocator may have moved past `index`; the map
            // lookup at the top of the loop picks it up.
        }
    }

    /// Resolve an address back to its allocation record.
    pub fn resolve(&self, address: &Address) -> WalletResult<RegisteredPath> {
        self.by_address
            .read()
            .expect("address map lock poisoned")
            .get(address)
            .copied()
            .ok_or_else(|| WalletError::UnknownAddress(address.to_string()))
    }

    /// The already-issued address at (chain, index).
    pub fn address_at(&self, chain: Chain, index: u32) -> WalletResult<Address> {
        self.by_path
            .read()
            .expect("path map lock poisoned")
            .get(&(chain, index))
            .cloned()
            .ok_or_else(|| {
                WalletError::UnknownAddress(format!("no address issued at {}/{}", chain, index))
            })
    }

    /// Re-derive the full script set for an allocation record.
    pub fn script_for(&self, registered: &RegisteredPath) -> WalletResult<WalletScript> {
        self.derive_script(registered.key_index, &registered.path)
    }

    /// Redeem script lookup by address.
    pub fn redeem_script_for(&self, address: &Address) -> WalletResult<ScriptBuf> {
        let registered = self.resolve(address)?;
        Ok(self.script_for(&registered)?.redeem_script)
    }

    /// Every address issued so far, both chains.
    pub fn all_addresses(&self) -> Vec<Address> {
        self.by_address
            .read()
            .expect("address map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Next unallocated index on a chain.
    pub fn next_index(&self, chain: Chain) -> u32 {
        *self.counters[chain.index() as usize]
            .lock()
            .expect("chain counter mutex poisoned")
    }

    fn derive_script(&self, key_index: u32, path: &WalletPath) -> WalletResult<WalletScript> {
        let trio = self.keychain.derive_trio(key_index, path)?;
        build_script_for_trio(&trio, self.mode, self.keychain.network())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SECP;
    use bitcoin::bip32::{ExtendedPrivKey, ExtendedPubKey};
    use bitcoin::Network;
    use std::collections::BTreeMap;

    fn test_registry() -> PathRegistry {
        let xpub = |seed: u8| {
            let xprv = ExtendedPrivKey::new_master(Network::Testnet, &[seed; 32]).unwrap();
            ExtendedPubKey::from_priv(&SECP, &xprv)
        };
        let mut cosigners = BTreeMap::new();
        cosigners.insert(0, xpub(3));
        cosigners.insert(1, xpub(4));
        let keychain =
            Keychain::new(Network::Testnet, xpub(1), xpub(2), cosigners).unwrap();
        PathRegistry::new(Arc::new(keychain), WalletMode::Segwit, 0).unwrap()
    }

    #[test]
    fn allocation_is_sequential_and_resolvable() {
        let registry = test_registry();
        let (first, addr_a) = registry.next_address(Chain::External).unwrap();
        let (second, addr_b) = registry.next_address(Chain::External).unwrap();
        assert_eq!(first.path.index, 0);
        assert_eq!(second.path.index, 1);
        assert_ne!(addr_a, addr_b);
        assert_eq!(registry.resolve(&addr_b).unwrap(), second);
    }

    #[test]
    fn chains_have_independent_counters() {
        let registry = test_registry();
        registry.next_address(Chain::External).unwrap();
        let (change, _) = registry.next_address(Chain::Internal).unwrap();
        assert_eq!(change.path.index, 0);
        assert_eq!(change.path.chain, Chain::Internal);
    }

    #[test]
    fn ensure_address_is_idempotent() {
        let registry = test_registry();
        let a = registry.ensure_address(Chain::External, 4).unwrap();
        let b = registry.ensure_address(Chain::External, 4).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.next_index(Chain::External), 5);
    }

    #[test]
    fn upgrade_changes_scripts_for_new_allocations_only() {
        let registry = test_registry();
        let (_, old_addr) = registry.next_address(Chain::External).unwrap();
        registry
            .key_index()
            .upgrade(1, registry.keychain.as_ref())
            .unwrap();
        let (fresh, fresh_addr) = registry.next_address(Chain::External).unwrap();
        assert_eq!(fresh.key_index, 1);
        assert_ne!(old_addr, fresh_addr);
        // Old address still resolves with its allocation-time key index.
        let old = registry.resolve(&old_addr).unwrap();
        assert_eq!(old.key_index, 0);
        assert_eq!(
            registry.script_for(&old).unwrap().address,
            old_addr
        );
    }
}
