//! Standardized error handling for the CoVault wallet core
//!
//! Every fallible operation in this crate returns [`WalletError`], a typed
//! taxonomy that lets callers decide between retry, abort, and fatal without
//! string matching. Collaborator I/O failures (balance index, fee feed,
//! broadcaster) are carried through as their own variants; no code path
//! returns an untyped failure.
//!
//! # Security Considerations
//!
//! - Error messages never contain key material, passphrases, or full
//!   addresses beyond what the caller already supplied
//! - Authentication failures are deliberately message-free

use thiserror::Error;

/// The main error type for the CoVault wallet core.
#[derive(Debug, Error)]
pub enum WalletError {
    /// Malformed path, address, or output request. Caller's fault, not retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A path requested private derivation from a public-only key, or the
    /// path itself is malformed.
    #[error("Invalid derivation path: {0}")]
    InvalidPath(String),

    /// Derivation index exhaustion (component outside the non-hardened range).
    #[error("Derivation index overflow: {0}")]
    DerivationOverflow(String),

    /// The three cosigning keys were not derived at matching chain/index
    /// positions.
    #[error("Derivation path mismatch: expected suffix {expected}, found {found}")]
    PathMismatch { expected: String, found: String },

    /// Address was not generated by this wallet's path registry.
    #[error("Unknown address: {0}")]
    UnknownAddress(String),

    /// Key-index downgrade attempt or no cosigner key registered for the
    /// requested index.
    #[error("Invalid key index {requested} (current {current})")]
    InvalidKeyIndex { current: u32, requested: u32 },

    /// Bad unlock credential.
    #[error("Authentication failed")]
    Authentication,

    /// Operation requires the wallet to be unlocked.
    #[error("Wallet is locked")]
    WalletLocked,

    /// No UTXO subset covers outputs plus fee. Carries the shortfall.
    #[error("Insufficient funds: needed {needed} sat, available {available} sat")]
    InsufficientFunds { needed: u64, available: u64 },

    /// Fee feed unreachable and no cached or fallback rate exists.
    #[error("Fee rate unavailable: {0}")]
    FeeUnavailable(String),

    /// Lost the optimistic-lock race on a selected UTXO. Callers should retry
    /// selection with fresh UTXO data, not resend the same candidate.
    #[error("Coin selection conflict: {0}")]
    CoinSelectionConflict(String),

    /// Internal invariant violation in an assembled transaction. Fatal,
    /// indicates a coin-selection defect; never silently corrected.
    #[error("Imbalanced transaction: {0}")]
    ImbalancedTransaction(String),

    /// Balance/UTXO index collaborator failure.
    #[error("UTXO index error: {0}")]
    Index(String),

    /// Broadcaster collaborator failure.
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// External signer collaborator failure.
    #[error("Signer error: {0}")]
    Signer(String),

    /// Failure encrypting or decrypting backup key material.
    #[error("Key vault error: {0}")]
    Vault(String),
}

impl WalletError {
    /// Shortfall in satoshis for an [`WalletError::InsufficientFunds`] error,
    /// zero for every other variant.
    pub fn shortfall(&self) -> u64 {
        match self {
            WalletError::InsufficientFunds { needed, available } => {
                needed.saturating_sub(*available)
            }
            _ => 0,
        }
    }

    /// Whether the caller may usefully retry the operation after refreshing
    /// external state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WalletError::CoinSelectionConflict(_)
                | WalletError::FeeUnavailable(_)
                | WalletError::Index(_)
                | WalletError::Broadcast(_)
        )
    }
}

impl From<bitcoin::bip32::Error> for WalletError {
    fn from(err: bitcoin::bip32::Error) -> Self {
        use bitcoin::bip32::Error as Bip32Error;
        match err {
            Bip32Error::CannotDeriveFromHardenedKey => WalletError::InvalidPath(
                "cannot derive a hardened child from a public-only key".to_string(),
            ),
            Bip32Error::InvalidChildNumber(n) => {
                WalletError::DerivationOverflow(format!("child index {} out of range", n))
            }
            Bip32Error::InvalidChildNumberFormat | Bip32Error::InvalidDerivationPathFormat => {
                WalletError::InvalidPath(err.to_string())
            }
            other => WalletError::Validation(format!("bip32 error: {}", other)),
        }
    }
}

impl From<bitcoin::address::Error> for WalletError {
    fn from(err: bitcoin::address::Error) -> Self {
        WalletError::Validation(format!("invalid Bitcoin address: {}", err))
    }
}

/// Type alias for a Result with [`WalletError`].
pub type WalletResult<T> = Result<T, WalletError>;
