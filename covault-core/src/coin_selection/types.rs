//! Core types for coin selection
//!
//! [`Utxo`] is the wallet's view of one unspent output as reported by the
//! external balance/UTXO index: read-mostly, with contention handled through
//! the optimistic [`LeaseTable`] rather than flags on the value itself.
//! A lease is (outpoint, holder token, expiry), so conflicting claims and
//! expiry are explicit and testable; the external index stays the source of
//! truth and a lost race surfaces as a conflict error at broadcast time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bitcoin::{Address, Amount, OutPoint};
use log::debug;

use crate::error::{WalletError, WalletResult};
use crate::types::OutputRequest;

/// Unspent transaction output as reported by the external index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// Reference to the transaction output (txid and vout)
    pub outpoint: OutPoint,
    /// Amount in this UTXO
    pub amount: Amount,
    /// The wallet address that owns this output
    pub address: Address,
    /// Number of confirmations (0 for unconfirmed)
    pub confirmations: u32,
}

impl Utxo {
    pub fn new(outpoint: OutPoint, amount: Amount, address: Address, confirmations: u32) -> Self {
        Self {
            outpoint,
            amount,
            address,
            confirmations,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }

    /// Unique identifier for logging and diagnostics.
    pub fn id(&self) -> String {
        format!("{}:{}", self.outpoint.txid, self.outpoint.vout)
    }
}

/// Opaque holder token for a set of leased UTXOs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(u64);

#[derive(Debug, Clone)]
struct Lease {
    holder: LeaseToken,
    expires_at: Instant,
}

/// Default lease lifetime; long enough to sign and broadcast, short enough
/// that an abandoned selection frees its inputs.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(120);

/// Optimistic per-outpoint locks preventing two concurrent selections from
/// spending the same input.
///
/// Acquisition is all-or-nothing: if any requested outpoint is held by an
/// unexpired lease of another holder, nothing is taken and the caller gets a
/// [`WalletError::CoinSelectionConflict`].
pub struct LeaseTable {
    leases: Mutex<HashMap<OutPoint, Lease>>,
    ttl: Duration,
    next_token: AtomicU64,
}

impl LeaseTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            ttl,
            next_token: AtomicU64::new(1),
        }
    }

    /// Lease all given outpoints to a fresh holder.
    pub fn acquire(&self, outpoints: &[OutPoint]) -> WalletResult<LeaseToken> {
        let now = Instant::now();
        let mut leases = self.leases.lock().expect("lease table mutex poisoned");
        leases.retain(|_, lease| lease.expires_at > now);

        if let Some(held) = outpoints.iter().find(|op| leases.contains_key(op)) {
            return Err(WalletError::CoinSelectionConflict(format!(
                "outpoint {} is leased by a concurrent selection",
                held
            )));
        }

        let token = LeaseToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        let expires_at = now + self.ttl;
        for outpoint in outpoints {
            leases.insert(*outpoint, Lease { holder: token, expires_at });
        }
        debug!("leased {} outpoints to {:?}", outpoints.len(), token);
        Ok(token)
    }

    /// Release every lease held by `token`. Idempotent.
    pub fn release(&self, token: LeaseToken) {
        self.leases
            .lock()
            .expect("lease table mutex poisoned")
            .retain(|_, lease| lease.holder != token);
    }

    /// Whether an outpoint is currently held by an unexpired lease.
    pub fn is_leased(&self, outpoint: &OutPoint) -> bool {
        let now = Instant::now();
        self.leases
            .lock()
            .expect("lease table mutex poisoned")
            .get(outpoint)
            .map(|lease| lease.expires_at > now)
            .unwrap_or(false)
    }

    /// Outpoints currently held by unexpired leases.
    pub fn leased_outpoints(&self) -> HashSet<OutPoint> {
        let now = Instant::now();
        self.leases
            .lock()
            .expect("lease table mutex poisoned")
            .iter()
            .filter(|(_, lease)| lease.expires_at > now)
            .map(|(op, _)| *op)
            .collect()
    }

    /// Number of unexpired leases.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.leases
            .lock()
            .expect("lease table mutex poisoned")
            .values()
            .filter(|lease| lease.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_TTL)
    }
}

/// A funded, balanced selection: the transient result of coin selection,
/// consumed by the transaction assembler and then discarded.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Selected inputs, in selection order.
    pub inputs: Vec<Utxo>,
    /// Final ordered outputs, including the change output if one was added.
    pub outputs: Vec<OutputRequest>,
    /// Exact fee: `sum(inputs) - sum(outputs)`.
    pub fee: Amount,
    /// Position of the change output within `outputs`, if any.
    pub change_position: Option<usize>,
    /// Virtual-size estimate the fee was computed from.
    pub estimated_vsize: usize,
}

impl Selection {
    pub fn input_total(&self) -> Amount {
        self.inputs.iter().map(|u| u.amount).sum()
    }

    pub fn output_total(&self) -> Amount {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    pub fn change_amount(&self) -> Option<Amount> {
        self.change_position.map(|i| self.outputs[i].amount)
    }
}

/// Options controlling one selection run.
#[derive(Debug, Clone)]
pub struct SelectionOptions {
    /// Include unconfirmed UTXOs as candidates.
    pub zero_conf_allowed: bool,
    /// Randomize the change output's position among the outputs, so the
    /// change is not leaked by always sitting last.
    pub randomize_change_position: bool,
    /// Absolute fee overriding the rate-based computation entirely.
    pub force_fee: Option<Amount>,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            zero_conf_allowed: false,
            randomize_change_position: true,
            force_fee: None,
        }
    }
}
