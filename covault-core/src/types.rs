//! Common data types for the CoVault wallet core
//!
//! These types are shared across the key-derivation, selection, and
//! orchestration layers. They are designed to NOT contain sensitive
//! cryptographic material, with the single exception of [`SensitiveString`],
//! which exists precisely to carry secrets safely.
//!
//! Amounts are always exact integer counts of satoshis ([`bitcoin::Amount`]);
//! floating point never touches a value that ends up in a transaction.

use std::fmt;

use bitcoin::{Address, Amount, Network};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{WalletError, WalletResult};

// Constants for Bitcoin-specific values

/// Constant for dust threshold (minimum economical output value, satoshis)
pub const DUST_THRESHOLD: u64 = 546;

/// Constant for satoshis per Bitcoin
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Constant for maximum Bitcoin supply in satoshis
pub const MAX_BITCOIN_SUPPLY: u64 = 21_000_000 * SATS_PER_BTC;

/// Get the dust threshold for a network
///
/// Test networks share mainnet's relay rules here; only the constant is
/// centralized so a future divergence has one place to live.
pub fn get_dust_threshold(_network: Network) -> u64 {
    DUST_THRESHOLD
}

/// Determines if an amount is considered "dust" (too small to be economically viable)
pub fn is_dust_amount(amount_sats: u64) -> bool {
    amount_sats <= DUST_THRESHOLD
}

/// Address chain within the wallet's derivation tree.
///
/// External addresses are handed out for receiving; internal addresses are
/// only ever used for change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    /// Receiving addresses, shown to counterparties
    External,
    /// Change addresses, never handed out
    Internal,
}

impl Chain {
    /// The chain's position in a derivation path.
    pub fn index(self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }

    /// Both chains, in scan order.
    pub fn all() -> [Chain; 2] {
        [Chain::External, Chain::Internal]
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::External => write!(f, "external"),
            Chain::Internal => write!(f, "internal"),
        }
    }
}

/// Script mode of the wallet, fixed at creation and never changed per-address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletMode {
    /// Legacy P2SH around the 2-of-3 script
    Legacy,
    /// P2SH-wrapped segwit v0 (P2SH-P2WSH) around the 2-of-3 witness script
    Segwit,
}

impl WalletMode {
    pub fn is_segwit(self) -> bool {
        matches!(self, WalletMode::Segwit)
    }
}

/// A single requested payment output: destination plus exact satoshi value.
///
/// The polymorphic output shapes accepted at the API boundary (maps,
/// pair lists, object lists) are normalized into an ordered list of these
/// before any selection logic sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRequest {
    /// Destination address (network-checked)
    pub address: Address,
    /// Exact value in satoshis
    pub amount: Amount,
}

impl OutputRequest {
    /// Create a validated output request.
    ///
    /// Zero-value and beyond-supply outputs are rejected here so the
    /// selection and assembly layers never see them.
    pub fn new(address: Address, amount: Amount) -> WalletResult<Self> {
        if amount.to_sat() == 0 {
            return Err(WalletError::Validation(
                "output value must be greater than zero".to_string(),
            ));
        }
        if amount.to_sat() > MAX_BITCOIN_SUPPLY {
            return Err(WalletError::Validation(format!(
                "output value {} exceeds maximum Bitcoin supply",
                amount
            )));
        }
        Ok(Self { address, amount })
    }
}

/// Normalize an ordered list of (destination, value) pairs into validated
/// output requests.
///
/// This is the single entry point for the shape-variant output specs the
/// public surface accepts; internal components only ever see the result.
pub fn normalize_outputs<I>(pairs: I) -> WalletResult<Vec<OutputRequest>>
where
    I: IntoIterator<Item = (Address, Amount)>,
{
    let outputs: Vec<OutputRequest> = pairs
        .into_iter()
        .map(|(address, amount)| OutputRequest::new(address, amount))
        .collect::<WalletResult<_>>()?;
    if outputs.is_empty() {
        return Err(WalletError::Validation(
            "at least one output is required".to_string(),
        ));
    }
    Ok(outputs)
}

/// Parse and normalize outputs given as address strings, checking each
/// against the wallet's network.
pub fn normalize_output_strings<I>(pairs: I, network: Network) -> WalletResult<Vec<OutputRequest>>
where
    I: IntoIterator<Item = (String, u64)>,
{
    use std::str::FromStr;
    let parsed: Vec<(Address, Amount)> = pairs
        .into_iter()
        .map(|(addr, sats)| {
            let address = Address::from_str(&addr)
                .map_err(WalletError::from)?
                .require_network(network)
                .map_err(WalletError::from)?;
            Ok((address, Amount::from_sat(sats)))
        })
        .collect::<WalletResult<_>>()?;
    normalize_outputs(parsed)
}

/// A string that contains sensitive data that should be zeroed when dropped
///
/// # Security
///
/// Passphrases and other secrets ride in this wrapper so they are wiped from
/// memory when the value goes out of scope, including on error paths.
#[derive(Zeroize)]
pub struct SensitiveString {
    inner: String,
}

impl SensitiveString {
    /// Create a new SensitiveString
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: value.into(),
        }
    }

    /// Access the inner string
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Byte view of the secret, for key-derivation inputs
    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Drop for SensitiveString {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

impl Clone for SensitiveString {
    fn clone(&self) -> Self {
        Self::new(self.inner.clone())
    }
}

impl fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveString([REDACTED], length={})", self.len())
    }
}

impl PartialEq for SensitiveString {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Eq for SensitiveString {}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
