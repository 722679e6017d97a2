//! Deterministic largest-first coin selection
//!
//! Canonical selection policy for this wallet: candidates are ordered
//! largest-first (ties broken by outpoint), which minimizes input count and
//! therefore transaction size and fee. The fee/size interdependency is solved
//! iteratively: the size estimate and fee are recomputed after every input
//! addition, because each added input grows the transaction and raises the
//! fee at the given rate.
//!
//! Change handling: a remainder above the dust threshold becomes a change
//! output whose position among the outputs is randomized (unless disabled);
//! a remainder at or below the threshold is folded into the fee instead. A
//! forced fee replaces the computed fee entirely and skips the refinement.

use bitcoin::{Address, Amount, Network};
use log::debug;
use rand::Rng;

use crate::coin_selection::types::{Selection, SelectionOptions, Utxo};
use crate::error::{WalletError, WalletResult};
use crate::fee_estimation::FeeRate;
use crate::types::{get_dust_threshold, OutputRequest, WalletMode};

/// Fixed transaction overhead in vbytes (version, locktime, counts).
pub const TX_OVERHEAD_VSIZE: usize = 10;

/// Approximate vsize of one output (value + P2SH/P2PKH-sized script).
pub const OUTPUT_VSIZE: usize = 34;

/// Approximate vsize of a legacy P2SH 2-of-3 input: outpoint + sequence +
/// scriptSig carrying two 72-byte signatures and the 105-byte redeem script.
pub const INPUT_VSIZE_P2SH_2OF3: usize = 296;

/// Approximate vsize of a P2SH-P2WSH 2-of-3 input after the witness
/// discount: 35-byte scriptSig push plus ~255 witness bytes at quarter
/// weight.
pub const INPUT_VSIZE_P2SH_P2WSH_2OF3: usize = 139;

/// The coin selection engine.
pub struct CoinSelector {
    mode: WalletMode,
    dust_threshold: u64,
}

impl CoinSelector {
    pub fn new(mode: WalletMode, network: Network) -> Self {
        Self {
            mode,
            dust_threshold: get_dust_threshold(network),
        }
    }

    /// Per-input vsize for this wallet's script mode.
    pub fn input_vsize(&self) -> usize {
        match self.mode {
            WalletMode::Legacy => INPUT_VSIZE_P2SH_2OF3,
            WalletMode::Segwit => INPUT_VSIZE_P2SH_P2WSH_2OF3,
        }
    }

    /// Estimated vsize for a transaction with the given input/output counts.
    pub fn estimate_vsize(&self, inputs: usize, outputs: usize) -> usize {
        TX_OVERHEAD_VSIZE + inputs * self.input_vsize() + outputs * OUTPUT_VSIZE
    }

    /// Select inputs covering `outputs` plus fee at `fee_rate`.
    ///
    /// `change_address` receives any above-dust remainder. The candidate set
    /// should already exclude leased outpoints; this function takes no locks
    /// and has no side effects, so a failed selection leaves nothing behind.
    pub fn select(
        &self,
        utxos: &[Utxo],
        outputs: &[OutputRequest],
        fee_rate: FeeRate,
        change_address: &Address,
        options: &SelectionOptions,
    ) -> WalletResult<Selection> {
        if outputs.is_empty() {
            return Err(WalletError::Validation(
                "at least one output is required".to_string(),
            ));
        }
        if let Some(zero) = outputs.iter().find(|o| o.amount.to_sat() == 0) {
            return Err(WalletError::Validation(format!(
                "zero-value output to {}",
                zero.address
            )));
        }

        let candidates = self.ordered_candidates(utxos, options.zero_conf_allowed);
        let target: Amount = outputs.iter().map(|o| o.amount).sum();
        let available: Amount = candidates.iter().map(|u| u.amount).sum();

        if let Some(forced) = options.force_fee {
            return self.select_forced(&candidates, outputs, target, available, forced, change_address, options);
        }

        let mut selected: Vec<Utxo> = Vec::new();
        let mut total = Amount::from_sat(0);

        for utxo in &candidates {
            selected.push((*utxo).clone());
            total += utxo.amount;

            // Fee and size assuming a change output is added.
            let vsize_with_change = self.estimate_vsize(selected.len(), outputs.len() + 1);
            let fee_with_change = fee_rate.fee_for_vsize(vsize_with_change);

            if total >= target + fee_with_change {
                let remainder = total - target - fee_with_change;
                if remainder.to_sat() > self.dust_threshold {
                    let change = OutputRequest::new(change_address.clone(), remainder)?;
                    let (final_outputs, position) =
                        place_change(outputs, change, options.randomize_change_position);
                    debug!(
                        "selected {} inputs, fee {} sat, change {} sat",
                        selected.len(),
                        fee_with_change.to_sat(),
                        remainder.to_sat()
                    );
                    return Ok(Selection {
                        inputs: selected,
                        outputs: final_outputs,
                        fee: fee_with_change,
                        change_position: Some(position),
                        estimated_vsize: vsize_with_change,
                    });
                }
                // Dust remainder: drop the change output and fold the
                // remainder into the fee.
                return Ok(self.finish_without_change(selected, outputs, total, target));
            }

            // The selection may cover the target without a change output even
            // when it cannot yet afford one (the sweep margin).
            let vsize_no_change = self.estimate_vsize(selected.len(), outputs.len());
            let fee_no_change = fee_rate.fee_for_vsize(vsize_no_change);
            if total >= target + fee_no_change {
                let remainder = total - target - fee_no_change;
                if remainder.to_sat() <= self.dust_threshold {
                    return Ok(self.finish_without_change(selected, outputs, total, target));
                }
                // Above-dust remainder but no room for a change output yet:
                // keep accumulating rather than overpaying the fee.
            }
        }

        let worst_case_fee =
            fee_rate.fee_for_vsize(self.estimate_vsize(candidates.len().max(1), outputs.len() + 1));
        Err(WalletError::InsufficientFunds {
            needed: (target + worst_case_fee).to_sat(),
            available: available.to_sat(),
        })
    }

    /// Largest possible 1-output spend from the candidate set: the total of
    /// all spendable UTXOs minus the sweep fee.
    pub fn max_spendable(
        &self,
        utxos: &[Utxo],
        fee_rate: FeeRate,
        zero_conf_allowed: bool,
    ) -> Amount {
        let candidates = self.ordered_candidates(utxos, zero_conf_allowed);
        if candidates.is_empty() {
            return Amount::from_sat(0);
        }
        let total: Amount = candidates.iter().map(|u| u.amount).sum();
        let fee = fee_rate.fee_for_vsize(self.estimate_vsize(candidates.len(), 1));
        total.checked_sub(fee).unwrap_or(Amount::from_sat(0))
    }

    fn ordered_candidates<'a>(&self, utxos: &'a [Utxo], zero_conf_allowed: bool) -> Vec<&'a Utxo> {
        let mut candidates: Vec<&Utxo> = utxos
            .iter()
            .filter(|u| zero_conf_allowed || u.is_confirmed())
            .collect();
        // Largest-first, outpoint as the deterministic tie-break.
        candidates.sort_by(|a, b| {
            b.amount
                .cmp(&a.amount)
                .then_with(|| a.outpoint.cmp(&b.outpoint))
        });
        candidates
    }

    fn select_forced(
        &self,
        candidates: &[&Utxo],
        outputs: &[OutputRequest],
        target: Amount,
        available: Amount,
        forced: Amount,
        change_address: &Address,
        options: &SelectionOptions,
    ) -> WalletResult<Selection> {
        let required = target + forced;
        let mut selected: Vec<Utxo> = Vec::new();
        let mut total = Amount::from_sat(0);
        for utxo in candidates {
            selected.push((*utxo).clone());
            total += utxo.amount;
            if total >= required {
                let vsize = self.estimate_vsize(selected.len(), outputs.len() + 1);
                let remainder = total - required;
                if remainder.to_sat() > self.dust_threshold {
                    let change = OutputRequest::new(change_address.clone(), remainder)?;
                    let (final_outputs, position) =
                        place_change(outputs, change, options.randomize_change_position);
                    return Ok(Selection {
                        inputs: selected,
                        outputs: final_outputs,
                        fee: forced,
                        change_position: Some(position),
                        estimated_vsize: vsize,
                    });
                }
                return Ok(self.finish_without_change(selected, outputs, total, target));
            }
        }
        Err(WalletError::InsufficientFunds {
            needed: required.to_sat(),
            available: available.to_sat(),
        })
    }

    fn finish_without_change(
        &self,
        selected: Vec<Utxo>,
        outputs: &[OutputRequest],
        total: Amount,
        target: Amount,
    ) -> Selection {
        let vsize = self.estimate_vsize(selected.len(), outputs.len());
        let fee = total - target;
        debug!(
            "selected {} inputs, fee {} sat, no change",
            selected.len(),
            fee.to_sat()
        );
        Selection {
            inputs: selected,
            outputs: outputs.to_vec(),
            fee,
            change_position: None,
            estimated_vsize: vsize,
        }
    }
}

/// Insert the change output at a randomized (or final) position so the
/// change is not identifiable by placement.
pub(crate) fn place_change(
    outputs: &[OutputRequest],
    change: OutputRequest,
    randomize: bool,
) -> (Vec<OutputRequest>, usize) {
    let position = if randomize {
        rand::thread_rng().gen_range(0..=outputs.len())
    } else {
        outputs.len()
    };
    let mut all = outputs.to_vec();
    all.insert(position, change);
    (all, position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::opcodes::all::OP_PUSHNUM_1;
    use bitcoin::blockdata::script::Builder;
    use bitcoin::hashes::Hash;
    use bitcoin::{OutPoint, Txid};

    fn test_address(tag: u8) -> Address {
        let script = Builder::new()
            .push_opcode(OP_PUSHNUM_1)
            .push_slice([tag])
            .into_script();
        Address::p2sh(&script, Network::Regtest).unwrap()
    }

    fn utxo(n: u8, sats: u64, confirmations: u32) -> Utxo {
        Utxo {
            outpoint: OutPoint::new(Txid::from_byte_array([n; 32]), 0),
            amount: Amount::from_sat(sats),
            address: test_address(n),
            confirmations,
        }
    }

    fn selector() -> CoinSelector {
        CoinSelector::new(WalletMode::Legacy, Network::Regtest)
    }

    fn fixed_options() -> SelectionOptions {
        SelectionOptions {
            randomize_change_position: false,
            ..SelectionOptions::default()
        }
    }

    #[test]
    fn prefers_largest_inputs_first() {
        let utxos = vec![utxo(1, 10_000, 6), utxo(2, 500_000, 6), utxo(3, 50_000, 6)];
        let outputs = vec![OutputRequest::new(test_address(9), Amount::from_sat(100_000)).unwrap()];
        let sel = selector()
            .select(
                &utxos,
                &outputs,
                FeeRate::from_sat_per_kvb(1_000),
                &test_address(10),
                &fixed_options(),
            )
            .unwrap();
        assert_eq!(sel.inputs.len(), 1);
        assert_eq!(sel.inputs[0].amount.to_sat(), 500_000);
    }

    #[test]
    fn balance_is_exact_with_change() {
        let utxos = vec![utxo(1, 200_000, 6)];
        let outputs = vec![OutputRequest::new(test_address(9), Amount::from_sat(50_000)).unwrap()];
        let rate = FeeRate::from_sat_per_kvb(2_000);
        let sel = selector()
            .select(&utxos, &outputs, rate, &test_address(10), &fixed_options())
            .unwrap();
        assert_eq!(sel.change_position, Some(1));
        assert_eq!(sel.input_total(), sel.output_total() + sel.fee);
        assert_eq!(sel.fee, rate.fee_for_vsize(sel.estimated_vsize));
    }

    #[test]
    fn dust_remainder_folds_into_fee() {
        let rate = FeeRate::from_sat_per_kvb(1_000);
        let selector = selector();
        // One input, one output, no change: remainder lands 100 sat above
        // the no-change fee, well under the dust threshold.
        let fee_no_change = rate.fee_for_vsize(selector.estimate_vsize(1, 1));
        let utxos = vec![utxo(1, 50_000 + fee_no_change.to_sat() + 100, 6)];
        let outputs = vec![OutputRequest::new(test_address(9), Amount::from_sat(50_000)).unwrap()];
        let sel = selector
            .select(&utxos, &outputs, rate, &test_address(10), &fixed_options())
            .unwrap();
        assert_eq!(sel.change_position, None);
        assert_eq!(sel.outputs.len(), 1);
        assert_eq!(sel.fee.to_sat(), fee_no_change.to_sat() + 100);
        assert_eq!(sel.input_total(), sel.output_total() + sel.fee);
    }

    #[test]
    fn unconfirmed_excluded_by_default() {
        let utxos = vec![utxo(1, 500_000, 0)];
        let outputs = vec![OutputRequest::new(test_address(9), Amount::from_sat(100_000)).unwrap()];
        let err = selector()
            .select(
                &utxos,
                &outputs,
                FeeRate::from_sat_per_kvb(1_000),
                &test_address(10),
                &fixed_options(),
            )
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { available: 0, .. }));

        let mut options = fixed_options();
        options.zero_conf_allowed = true;
        let sel = selector()
            .select(
                &utxos,
                &outputs,
                FeeRate::from_sat_per_kvb(1_000),
                &test_address(10),
                &options,
            )
            .unwrap();
        assert_eq!(sel.inputs.len(), 1);
    }

    #[test]
    fn insufficient_funds_reports_shortfall() {
        let utxos = vec![utxo(1, 30_000, 6)];
        let outputs = vec![OutputRequest::new(test_address(9), Amount::from_sat(100_000)).unwrap()];
        let err = selector()
            .select(
                &utxos,
                &outputs,
                FeeRate::from_sat_per_kvb(1_000),
                &test_address(10),
                &fixed_options(),
            )
            .unwrap_err();
        match err {
            WalletError::InsufficientFunds { needed, available } => {
                assert_eq!(available, 30_000);
                assert!(needed > 100_000);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn forced_fee_is_used_verbatim() {
        let utxos = vec![utxo(1, 200_000, 6)];
        let outputs = vec![OutputRequest::new(test_address(9), Amount::from_sat(50_000)).unwrap()];
        let mut options = fixed_options();
        options.force_fee = Some(Amount::from_sat(25_000));
        let sel = selector()
            .select(
                &utxos,
                &outputs,
                FeeRate::from_sat_per_kvb(1_000),
                &test_address(10),
                &options,
            )
            .unwrap();
        assert_eq!(sel.fee.to_sat(), 25_000);
        assert_eq!(sel.change_amount().unwrap().to_sat(), 125_000);
    }

    #[test]
    fn max_spendable_is_payable_with_no_change() {
        let utxos = vec![utxo(1, 60_000, 6), utxo(2, 40_000, 6)];
        let rate = FeeRate::from_sat_per_kvb(5_000);
        let selector = selector();
        let max = selector.max_spendable(&utxos, rate, false);
        assert!(max.to_sat() > 0);

        let outputs = vec![OutputRequest::new(test_address(9), max).unwrap()];
        let sel = selector
            .select(&utxos, &outputs, rate, &test_address(10), &fixed_options())
            .unwrap();
        assert_eq!(sel.change_position, None);
        assert_eq!(sel.fee.to_sat(), 100_000 - max.to_sat());
        assert_eq!(sel.input_total(), sel.output_total() + sel.fee);
    }

    #[test]
    fn change_position_randomization_covers_all_slots() {
        let outputs: Vec<OutputRequest> = (0..3)
            .map(|i| OutputRequest::new(test_address(i), Amount::from_sat(10_000)).unwrap())
            .collect();
        let change = OutputRequest::new(test_address(10), Amount::from_sat(5_000)).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let (_, position) = place_change(&outputs, change.clone(), true);
            assert!(position <= outputs.len());
            seen.insert(position);
        }
        assert!(seen.len() > 1);
    }
}
