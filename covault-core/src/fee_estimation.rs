//! Fee rates and fee-strategy resolution
//!
//! Rates are integer satoshis per 1000 vbytes end to end; floating point is
//! never involved in a fee that reaches a transaction. The estimator maps a
//! [`FeeStrategy`] to a rate, consulting the external fee-rate feed for the
//! priority strategies and caching the answer for the current call cycle.
//! Absence of a rate is always a hard [`WalletError::FeeUnavailable`], never
//! a silent zero, and is not retried internally; the caller decides between
//! retry and abort.

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::{Amount, Network};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{WalletError, WalletResult};

/// A fee rate in satoshis per 1000 virtual bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeRate(u64);

impl FeeRate {
    pub const fn from_sat_per_kvb(rate: u64) -> Self {
        Self(rate)
    }

    pub const fn to_sat_per_kvb(self) -> u64 {
        self.0
    }

    /// Fee for a transaction of `vsize` virtual bytes, rounded up to the
    /// next satoshi.
    pub fn fee_for_vsize(self, vsize: usize) -> Amount {
        let sats = (vsize as u64 * self.0 + 999) / 1000;
        Amount::from_sat(sats)
    }
}

/// Fee strategies accepted by the payment surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeeStrategy {
    /// Caller supplies an absolute fee; rate lookup is bypassed entirely and
    /// the iterative fee/size refinement is skipped.
    ForceFee(Amount),
    /// Network minimum relay fee; resolved locally, no feed call.
    BaseFee,
    /// Feed-resolved rate for slow confirmation.
    LowPriority,
    /// Feed-resolved rate for ordinary confirmation.
    Optimal,
    /// Feed-resolved rate for next-block confirmation.
    HighPriority,
}

impl FeeStrategy {
    /// Whether this strategy needs the external fee-rate feed.
    pub fn uses_feed(self) -> bool {
        matches!(
            self,
            FeeStrategy::LowPriority | FeeStrategy::Optimal | FeeStrategy::HighPriority
        )
    }
}

/// Errors from the fee-rate feed collaborator.
#[derive(Debug, Error)]
pub enum FeeRateError {
    #[error("fee feed unreachable: {0}")]
    Unreachable(String),
    #[error("fee feed returned no rate for {0}")]
    NoRate(String),
}

impl From<FeeRateError> for WalletError {
    fn from(err: FeeRateError) -> Self {
        WalletError::FeeUnavailable(err.to_string())
    }
}

/// External fee-rate feed collaborator.
///
/// May serve stale or cached data; returning an error (rather than a zero
/// rate) is the contract for "no rate available".
pub trait FeeRateProvider {
    fn recommended_rate(&self, strategy: FeeStrategy) -> Result<FeeRate, FeeRateError>;
}

impl<T: FeeRateProvider + ?Sized> FeeRateProvider for std::sync::Arc<T> {
    fn recommended_rate(&self, strategy: FeeStrategy) -> Result<FeeRate, FeeRateError> {
        (**self).recommended_rate(strategy)
    }
}

/// Network-specific rate floors.
pub mod defaults {
    use super::FeeRate;
    use bitcoin::Network;

    /// Minimum relay fee rate by network (sat/kvB).
    pub fn min_relay_rate(network: Network) -> FeeRate {
        match network {
            Network::Bitcoin | Network::Testnet | Network::Signet => {
                FeeRate::from_sat_per_kvb(1000)
            }
            Network::Regtest => FeeRate::from_sat_per_kvb(250),
            _ => FeeRate::from_sat_per_kvb(1000),
        }
    }

    /// Clamp a feed rate to at least the network's relay floor.
    pub fn clamp_to_floor(network: Network, rate: FeeRate) -> FeeRate {
        let floor = min_relay_rate(network);
        if rate < floor {
            floor
        } else {
            rate
        }
    }
}

/// Maps fee strategies to rates, caching feed answers per call cycle.
pub struct FeeEstimator<P: FeeRateProvider> {
    provider: P,
    network: Network,
    cache: Mutex<HashMap<FeeStrategy, FeeRate>>,
}

impl<P: FeeRateProvider> FeeEstimator<P> {
    pub fn new(provider: P, network: Network) -> Self {
        Self {
            provider,
            network,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a strategy to a rate.
    ///
    /// `ForceFee` carries an absolute fee, not a rate, and is rejected here;
    /// the coin selector consumes forced fees directly.
    pub fn rate(&self, strategy: FeeStrategy) -> WalletResult<FeeRate> {
        match strategy {
            FeeStrategy::ForceFee(_) => Err(WalletError::Validation(
                "forced fees have no per-KB rate; pass the strategy to selection".to_string(),
            )),
            FeeStrategy::BaseFee => Ok(defaults::min_relay_rate(self.network)),
            feed_strategy => {
                let mut cache = self.cache.lock().expect("fee cache mutex poisoned");
                if let Some(rate) = cache.get(&feed_strategy) {
                    return Ok(*rate);
                }
                let rate = self.provider.recommended_rate(feed_strategy)?;
                let rate = defaults::clamp_to_floor(self.network, rate);
                debug!(
                    "fee feed resolved {:?} to {} sat/kvB",
                    feed_strategy,
                    rate.to_sat_per_kvb()
                );
                cache.insert(feed_strategy, rate);
                Ok(rate)
            }
        }
    }

    /// Drop cached feed rates; the next lookup hits the feed again.
    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .expect("fee cache mutex poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFeed {
        calls: AtomicUsize,
        rate: Option<u64>,
    }

    impl FeeRateProvider for CountingFeed {
        fn recommended_rate(&self, strategy: FeeStrategy) -> Result<FeeRate, FeeRateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.rate
                .map(FeeRate::from_sat_per_kvb)
                .ok_or_else(|| FeeRateError::NoRate(format!("{:?}", strategy)))
        }
    }

    #[test]
    fn fee_rounds_up_to_the_next_satoshi() {
        let rate = FeeRate::from_sat_per_kvb(10_000);
        // 373 vbytes at 10 sat/vB = 3730 exactly; 1 extra vbyte rounds up.
        assert_eq!(rate.fee_for_vsize(373), Amount::from_sat(3730));
        assert_eq!(
            FeeRate::from_sat_per_kvb(10_001).fee_for_vsize(373),
            Amount::from_sat(3731)
        );
    }

    #[test]
    fn base_fee_never_touches_the_feed() {
        let feed = CountingFeed {
            calls: AtomicUsize::new(0),
            rate: None,
        };
        let estimator = FeeEstimator::new(feed, Network::Bitcoin);
        let rate = estimator.rate(FeeStrategy::BaseFee).unwrap();
        assert_eq!(rate, defaults::min_relay_rate(Network::Bitcoin));
        assert_eq!(estimator.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn feed_rates_are_cached_per_cycle() {
        let feed = CountingFeed {
            calls: AtomicUsize::new(0),
            rate: Some(42_000),
        };
        let estimator = FeeEstimator::new(feed, Network::Bitcoin);
        estimator.rate(FeeStrategy::Optimal).unwrap();
        estimator.rate(FeeStrategy::Optimal).unwrap();
        assert_eq!(estimator.provider.calls.load(Ordering::SeqCst), 1);
        estimator.clear_cache();
        estimator.rate(FeeStrategy::Optimal).unwrap();
        assert_eq!(estimator.provider.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_feed_rate_is_a_hard_error() {
        let feed = CountingFeed {
            calls: AtomicUsize::new(0),
            rate: None,
        };
        let estimator = FeeEstimator::new(feed, Network::Bitcoin);
        let err = estimator.rate(FeeStrategy::HighPriority).unwrap_err();
        assert!(matches!(err, WalletError::FeeUnavailable(_)));
    }

    #[test]
    fn feed_rates_are_clamped_to_the_relay_floor() {
        let feed = CountingFeed {
            calls: AtomicUsize::new(0),
            rate: Some(10),
        };
        let estimator = FeeEstimator::new(feed, Network::Bitcoin);
        let rate = estimator.rate(FeeStrategy::LowPriority).unwrap();
        assert_eq!(rate, defaults::min_relay_rate(Network::Bitcoin));
    }
}
