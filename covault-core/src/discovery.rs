//! Gap-limited wallet discovery
//!
//! Walks each derivation chain in order, asking the chain index whether each
//! address has ever been used, and stops once a run of consecutive unused
//! addresses reaches the gap limit. Addresses are materialized through the
//! path registry as the scan advances, so a completed (or interrupted) scan
//! leaves the registry populated and a re-run resumes over the same
//! addresses idempotently.
//!
//! Transient index failures get a single retry after a short backoff;
//! anything else aborts the scan with an error. Cancellation is cooperative
//! and is not an error: the report comes back with whatever was found and
//! `cancelled` set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Address, Amount};
use log::{debug, info, warn};
use thiserror::Error;

use crate::coin_selection::Utxo;
use crate::error::{WalletError, WalletResult};
use crate::registry::PathRegistry;
use crate::types::Chain;

/// Default run of consecutive unused addresses that ends a chain scan.
pub const DEFAULT_GAP_LIMIT: u32 = 200;

/// Default pause before retrying a transient index failure.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Errors surfaced by a chain index backend.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The index could not be reached at all.
    #[error("chain index unreachable: {0}")]
    Unreachable(String),

    /// The index accepted the request but did not answer in time.
    #[error("chain index timed out: {0}")]
    Timeout(String),

    /// The index answered with an error for this request.
    #[error("chain index rejected request: {0}")]
    Rejected(String),
}

impl IndexError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::Unreachable(_) | IndexError::Timeout(_))
    }
}

impl From<IndexError> for WalletError {
    fn from(err: IndexError) -> Self {
        WalletError::Index(err.to_string())
    }
}

/// Read access to an external chain index (an Electrum-style backend).
pub trait ChainIndexClient: Send + Sync {
    /// UTXOs currently funding any of the given addresses.
    fn utxos(&self, addresses: &[Address]) -> Result<Vec<Utxo>, IndexError>;

    /// Whether the address has ever appeared in a transaction, spent or not.
    fn address_used(&self, address: &Address) -> Result<bool, IndexError>;

    /// Aggregate (confirmed, unconfirmed) balance over the given addresses.
    fn balance(&self, addresses: &[Address]) -> Result<(Amount, Amount), IndexError> {
        let utxos = self.utxos(addresses)?;
        let confirmed = utxos
            .iter()
            .filter(|u| u.is_confirmed())
            .map(|u| u.amount)
            .sum();
        let unconfirmed = utxos
            .iter()
            .filter(|u| !u.is_confirmed())
            .map(|u| u.amount)
            .sum();
        Ok((confirmed, unconfirmed))
    }
}

/// Cooperative cancellation handle, cloneable across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Tunables for a discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub gap_limit: u32,
    pub retry_backoff: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            gap_limit: DEFAULT_GAP_LIMIT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Per-chain outcome of a scan.
#[derive(Debug, Clone)]
pub struct ChainScan {
    pub chain: Chain,
    /// Number of addresses queried.
    pub scanned: u32,
    /// Number of addresses with any history.
    pub used: u32,
    /// Highest index with history, if any.
    pub highest_used: Option<u32>,
}

/// Outcome of a full discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    pub utxos: Vec<Utxo>,
    pub confirmed: Amount,
    pub unconfirmed: Amount,
    pub external: ChainScan,
    pub internal: ChainScan,
    /// True when the run stopped early on request. Results up to that point
    /// are still valid.
    pub cancelled: bool,
}

/// Drives gap-limited scans over the registry's derivation chains.
pub struct DiscoveryEngine<'a> {
    registry: &'a PathRegistry,
    client: &'a dyn ChainIndexClient,
    options: DiscoveryOptions,
}

impl<'a> DiscoveryEngine<'a> {
    pub fn new(
        registry: &'a PathRegistry,
        client: &'a dyn ChainIndexClient,
        options: DiscoveryOptions,
    ) -> Self {
        Self {
            registry,
            client,
            options,
        }
    }

    /// Scan both chains and collect everything spendable.
    pub fn run(&self, cancel: &CancelToken) -> WalletResult<DiscoveryReport> {
        let mut utxos = Vec::new();
        let external = self.scan_chain(Chain::External, &mut utxos, cancel)?;
        let internal = self.scan_chain(Chain::Internal, &mut utxos, cancel)?;
        let cancelled = cancel.is_cancelled();

        let confirmed: Amount = utxos
            .iter()
            .filter(|u| u.is_confirmed())
            .map(|u| u.amount)
            .sum();
        let unconfirmed: Amount = utxos
            .iter()
            .filter(|u| !u.is_confirmed())
            .map(|u| u.amount)
            .sum();

        info!(
            "discovery finished: {} utxos, {} sat confirmed, {} sat unconfirmed, cancelled={}",
            utxos.len(),
            confirmed.to_sat(),
            unconfirmed.to_sat(),
            cancelled
        );

        Ok(DiscoveryReport {
            utxos,
            confirmed,
            unconfirmed,
            external,
            internal,
            cancelled,
        })
    }

    fn scan_chain(
        &self,
        chain: Chain,
        utxos: &mut Vec<Utxo>,
        cancel: &CancelToken,
    ) -> WalletResult<ChainScan> {
        let mut scan = ChainScan {
            chain,
            scanned: 0,
            used: 0,
            highest_used: None,
        };
        let mut index = 0u32;
        let mut consecutive_unused = 0u32;

        while consecutive_unused < self.options.gap_limit {
            if cancel.is_cancelled() {
                debug!("{chain} scan cancelled at index {index}");
                break;
            }
            let address = self.registry.ensure_address(chain, index)?;
            let used = self.with_retry(|| self.client.address_used(&address))?;
            scan.scanned += 1;
            if used {
                scan.used += 1;
                scan.highest_used = Some(index);
                consecutive_unused = 0;
                let mut found =
                    self.with_retry(|| self.client.utxos(std::slice::from_ref(&address)))?;
                utxos.append(&mut found);
            } else {
                consecutive_unused += 1;
            }
            index += 1;
        }

        debug!(
            "{chain} scan: {} addresses, {} used, highest {:?}",
            scan.scanned, scan.used, scan.highest_used
        );
        Ok(scan)
    }

    /// Run an index query, retrying once after a backoff if the failure
    /// looks transient.
    fn with_retry<T>(&self, mut query: impl FnMut() -> Result<T, IndexError>) -> WalletResult<T> {
        match query() {
            Ok(value) => Ok(value),
            Err(err) if err.is_transient() => {
                warn!("transient index failure, retrying once: {err}");
                std::thread::sleep(self.options.retry_backoff);
                query().map_err(WalletError::from)
            }
            Err(err) => Err(err.into()),
        }
    }
}
