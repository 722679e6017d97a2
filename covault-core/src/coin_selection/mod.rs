//! Coin selection and UTXO leasing
//!
//! Two concerns live here: choosing which UTXOs fund a transaction
//! ([`CoinSelector`]) and keeping concurrent builders from choosing the same
//! ones ([`LeaseTable`]). Selection itself is a pure function over a
//! candidate snapshot; the wallet acquires leases on the chosen outpoints
//! only after a selection succeeds, and releases them when the transaction
//! is broadcast or abandoned.

mod selector;
mod types;

pub use selector::{
    CoinSelector, INPUT_VSIZE_P2SH_2OF3, INPUT_VSIZE_P2SH_P2WSH_2OF3, OUTPUT_VSIZE,
    TX_OVERHEAD_VSIZE,
};
pub use types::{
    LeaseTable, LeaseToken, Selection, SelectionOptions, Utxo, DEFAULT_LEASE_TTL,
};
