//! Hierarchical-deterministic key derivation for the 2-of-3 cosigning scheme
//!
//! Derivation here is pure: given a root key and a path, the same key always
//! comes out, with no I/O and no stored state. The wallet's three roots
//! (primary, backup, and the rotating cosigner identified by a key index)
//! are always derived at *matching* chain/index suffixes so that the
//! resulting multisig scripts are reconstructible by any key holder.
//!
//! # Security Considerations
//!
//! - Private derivation only happens on explicitly supplied private roots;
//!   nothing in this module persists private material
//! - Paths are parsed once at the boundary ([`parse_path`]); internal code
//!   only ever sees structured values

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath, ExtendedPrivKey, ExtendedPubKey};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Network, PublicKey};
use once_cell::sync::Lazy;

use crate::error::{WalletError, WalletResult};
use crate::types::Chain;

/// Shared secp256k1 context for the whole crate.
pub(crate) static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Parse a derivation path string (`"m/0/5"`, hardened components with `'`)
/// into the structured form.
///
/// This is the single boundary where string paths enter the system.
pub fn parse_path(path: &str) -> WalletResult<DerivationPath> {
    DerivationPath::from_str(path).map_err(WalletError::from)
}

/// A wallet-internal chain/index pair.
///
/// This is the path *suffix* shared by all three cosigning keys for one
/// address; the bip32 form is two non-hardened components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalletPath {
    pub chain: Chain,
    pub index: u32,
}

impl WalletPath {
    pub fn new(chain: Chain, index: u32) -> Self {
        Self { chain, index }
    }

    /// The bip32 path suffix for this chain/index pair.
    pub fn to_derivation_path(&self) -> WalletResult<DerivationPath> {
        let components = vec![
            ChildNumber::from_normal_idx(self.chain.index())?,
            ChildNumber::from_normal_idx(self.index)?,
        ];
        Ok(DerivationPath::from(components))
    }
}

impl fmt::Display for WalletPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m/{}/{}", self.chain.index(), self.index)
    }
}

/// An extended key (public, and optionally private) together with the path it
/// was derived at.
///
/// Invariant: when the private half is present, its public image equals
/// `xpub`. Construction through [`derive_public`]/[`derive_private`]
/// guarantees this.
#[derive(Debug, Clone)]
pub struct HDKey {
    pub xpub: ExtendedPubKey,
    pub xprv: Option<ExtendedPrivKey>,
    pub path: DerivationPath,
}

impl HDKey {
    /// Compressed public key at this node.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self.xpub.public_key)
    }

    /// Depth of this node in the derivation tree.
    pub fn depth(&self) -> u8 {
        self.xpub.depth
    }

    /// Whether private material is present.
    pub fn is_private(&self) -> bool {
        self.xprv.is_some()
    }

    /// Drop the private half, keeping only the public image.
    pub fn into_public(mut self) -> Self {
        self.xprv = None;
        self
    }
}

/// Derive a public HDKey at `path` from a public root. Deterministic, pure.
///
/// Fails with [`WalletError::InvalidPath`] when the path contains a hardened
/// component (private derivation from a public-only key) and
/// [`WalletError::DerivationOverflow`] on index exhaustion.
pub fn derive_public(root: &ExtendedPubKey, path: &DerivationPath) -> WalletResult<HDKey> {
    let xpub = root.derive_pub(&SECP, path)?;
    Ok(HDKey {
        xpub,
        xprv: None,
        path: path.clone(),
    })
}

/// Derive a private HDKey at `path` from a private root. Deterministic, pure.
pub fn derive_private(root: &ExtendedPrivKey, path: &DerivationPath) -> WalletResult<HDKey> {
    let xprv = root.derive_priv(&SECP, path)?;
    let xpub = ExtendedPubKey::from_priv(&SECP, &xprv);
    Ok(HDKey {
        xpub,
        xprv: Some(xprv),
        path: path.clone(),
    })
}

/// The three cosigning keys derived at one matched path.
#[derive(Debug, Clone)]
pub struct KeyTrio {
    pub primary: HDKey,
    pub backup: HDKey,
    pub cosigner: HDKey,
}

/// The wallet's root public keys: primary, backup, and the registered
/// cosigner keys by key index.
///
/// Cosigner indices are append-only; rotating to a new cosigner registers a
/// new index rather than replacing an old entry, so addresses issued under
/// old indices stay reconstructible.
#[derive(Debug, Clone)]
pub struct Keychain {
    network: Network,
    primary: ExtendedPubKey,
    backup: ExtendedPubKey,
    cosigners: BTreeMap<u32, ExtendedPubKey>,
}

impl Keychain {
    /// Create a keychain. At least one cosigner key must be registered.
    pub fn new(
        network: Network,
        primary: ExtendedPubKey,
        backup: ExtendedPubKey,
        cosigners: BTreeMap<u32, ExtendedPubKey>,
    ) -> WalletResult<Self> {
        if cosigners.is_empty() {
            return Err(WalletError::Validation(
                "at least one cosigner key must be registered".to_string(),
            ));
        }
        Ok(Self {
            network,
            primary,
            backup,
            cosigners,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn primary(&self) -> &ExtendedPubKey {
        &self.primary
    }

    pub fn backup(&self) -> &ExtendedPubKey {
        &self.backup
    }

    /// The cosigner public key registered for a key index, if any.
    pub fn cosigner(&self, key_index: u32) -> Option<&ExtendedPubKey> {
        self.cosigners.get(&key_index)
    }

    pub fn has_cosigner(&self, key_index: u32) -> bool {
        self.cosigners.contains_key(&key_index)
    }

    /// All registered cosigner keys, ordered by key index.
    pub fn cosigners(&self) -> impl Iterator<Item = (u32, &ExtendedPubKey)> {
        self.cosigners.iter().map(|(k, v)| (*k, v))
    }

    /// Register an additional cosigner key under a fresh index.
    pub fn register_cosigner(&mut self, key_index: u32, key: ExtendedPubKey) -> WalletResult<()> {
        if self.cosigners.contains_key(&key_index) {
            return Err(WalletError::Validation(format!(
                "cosigner key index {} is already registered",
                key_index
            )));
        }
        self.cosigners.insert(key_index, key);
        Ok(())
    }

    /// Derive all three cosigning keys at a matched chain/index suffix.
    pub fn derive_trio(&self, key_index: u32, path: &WalletPath) -> WalletResult<KeyTrio> {
        let cosigner_root = self.cosigner(key_index).ok_or_else(|| {
            WalletError::Validation(format!(
                "no cosigner key registered for key index {}",
                key_index
            ))
        })?;
        let suffix = path.to_derivation_path()?;
        Ok(KeyTrio {
            primary: derive_public(&self.primary, &suffix)?,
            backup: derive_public(&self.backup, &suffix)?,
            cosigner: derive_public(cosigner_root, &suffix)?,
        })
    }
}
