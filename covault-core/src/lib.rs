//! CoVault Core Library
//!
//! This crate provides the transaction-construction core of the CoVault
//! 2-of-3 multisig Bitcoin wallet: key derivation, script and address
//! construction, coin selection, wallet discovery, and the half-signing
//! payment flow the cosigning service completes.
//!
//! # Modules
//!
//! - `types`: Core domain types and data structures
//! - `error`: The crate-wide error type
//! - `logging`: Security-aware logging infrastructure
//! - `keys`: BIP32 derivation and the multisig keychain
//! - `script`: 2-of-3 multisig script and address construction
//! - `registry`: Derivation path registry and key-index upgrades
//! - `fee_estimation`: Fee strategies and rate estimation
//! - `coin_selection`: UTXO selection and lease-based locking
//! - `tx_builder`: Transaction assembly and signing hooks
//! - `discovery`: Gap-limited wallet discovery
//! - `vault`: Passphrase encryption for the primary key
//! - `wallet`: The wallet orchestrator
//!
//! # Security Considerations
//!
//! Sensitive material is zeroized on drop, log output truncates anything
//! that looks like key data, and the primary private key only exists in
//! memory while the wallet is unlocked.

/// Core domain types for the wallet
pub mod types;

/// The crate-wide error type
pub mod error;

/// Secure logging functionality
pub mod logging;

/// BIP32 derivation and the multisig keychain
pub mod keys;

/// 2-of-3 multisig script and address construction
pub mod script;

/// Derivation path registry and key-index upgrades
pub mod registry;

/// Fee strategies and rate estimation
pub mod fee_estimation;

/// UTXO selection and lease-based locking
pub mod coin_selection;

/// Transaction assembly and signing hooks
pub mod tx_builder;

/// Gap-limited wallet discovery
pub mod discovery;

/// Passphrase encryption for the primary key
pub mod vault;

/// The wallet orchestrator
pub mod wallet;

pub use error::{WalletError, WalletResult};
pub use types::{Chain, OutputRequest, SensitiveString, WalletMode, DUST_THRESHOLD};
pub use wallet::{Broadcaster, UnlockCredential, Wallet, WalletBalance};
