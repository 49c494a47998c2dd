//! Coin selection and unsigned transaction assembly.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use kestrel_address::Address;
use kestrel_core::constants::TX_OVERHEAD_VBYTES;
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{checked_sum, Utxo};

use crate::transaction::{TxInput, TxOutput, UnsignedTransaction, SEQUENCE_FINAL, SEQUENCE_RBF};

/// Sequence that enables nLockTime without signalling RBF.
const SEQUENCE_LOCKTIME: u32 = 0xffff_fffe;

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// How the fee is determined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeePolicy {
    /// Absolute fee in minor units.
    Fixed(u64),
    /// Fee rate in minor units per virtual byte of the estimated size.
    PerVbyte(u64),
}

impl FeePolicy {
    /// Fee for a transaction of `vbytes`.
    pub fn fee_for(self, vbytes: u64) -> Result<u64> {
        match self {
            FeePolicy::Fixed(fee) => Ok(fee),
            FeePolicy::PerVbyte(rate) => rate.checked_mul(vbytes).ok_or(KestrelError::AmountOverflow),
        }
    }
}

/// Coin selection strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Spend the largest outputs first.
    #[default]
    LargestFirst,
    /// Search for a change-free subset, falling back to largest-first.
    ExactMatch,
}

/// Transaction builder configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Coin selection strategy
    pub strategy: SelectionStrategy,
    /// Node budget for the exact-match search
    pub max_exact_match_tries: usize,
    /// nLockTime of built transactions
    pub lock_time: u32,
    /// Signal replace-by-fee on every input
    pub enable_rbf: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::LargestFirst,
            max_exact_match_tries: 100_000,
            lock_time: 0,
            enable_rbf: true,
        }
    }
}

impl BuilderConfig {
    /// Sets the selection strategy.
    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets nLockTime.
    pub fn with_lock_time(mut self, lock_time: u32) -> Self {
        self.lock_time = lock_time;
        self
    }

    /// Enables or disables RBF signalling.
    pub fn with_rbf(mut self, enable: bool) -> Self {
        self.enable_rbf = enable;
        self
    }

    fn sequence(&self) -> u32 {
        if self.enable_rbf {
            SEQUENCE_RBF
        } else if self.lock_time > 0 {
            SEQUENCE_LOCKTIME
        } else {
            SEQUENCE_FINAL
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUILDER
// ═══════════════════════════════════════════════════════════════════════════════

struct Selection<'a> {
    inputs: Vec<&'a Utxo>,
    fee: u64,
    change: u64,
}

/// Size and fee parameters shared by every candidate evaluation.
struct Costs {
    target: u64,
    base_vbytes: u64,
    change_vbytes: u64,
    change_dust: u64,
    has_change: bool,
    fee: FeePolicy,
}

impl Costs {
    fn fee_without_change(&self, input_vbytes: u64) -> Result<u64> {
        self.fee.fee_for(self.base_vbytes + input_vbytes)
    }

    fn fee_with_change(&self, input_vbytes: u64) -> Result<u64> {
        self.fee
            .fee_for(self.base_vbytes + input_vbytes + self.change_vbytes)
    }

    /// `(fee, change)` if `total_in` covers the target, folding sub-dust change into the fee.
    fn settle(&self, total_in: u64, input_vbytes: u64) -> Result<Option<(u64, u64)>> {
        if self.has_change {
            let fee = self.fee_with_change(input_vbytes)?;
            if let Some(change) = total_in
                .checked_sub(self.target)
                .and_then(|r| r.checked_sub(fee))
            {
                if change >= self.change_dust {
                    return Ok(Some((fee, change)));
                }
            }
        }

        let fee = self.fee_without_change(input_vbytes)?;
        match total_in.checked_sub(self.target).filter(|&r| r >= fee) {
            Some(remainder) => {
                if !self.has_change && remainder - fee >= self.change_dust {
                    return Err(KestrelError::ValidationError(format!(
                        "{} of change needs a change address",
                        remainder - fee
                    )));
                }
                Ok(Some((remainder, 0)))
            }
            None => Ok(None),
        }
    }
}

/// Builds balanced unsigned transactions from a set of spendable outputs.
#[derive(Debug, Clone, Default)]
pub struct TransactionBuilder {
    config: BuilderConfig,
    change: Option<Address>,
}

impl TransactionBuilder {
    /// Creates a builder without a change address.
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            config,
            change: None,
        }
    }

    /// Sets the address that receives change.
    pub fn with_change(mut self, change: Address) -> Self {
        self.change = Some(change);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Selects inputs from `utxos` to pay `outputs` plus the fee.
    ///
    /// # Errors
    /// - `DustOutput` if a payment output is below its dust threshold
    /// - `InsufficientFunds` if the non-dust UTXOs cannot cover outputs and fee
    /// - `ValidationError` for no outputs, or change without a change address
    #[instrument(skip_all, fields(utxos = utxos.len(), outputs = outputs.len()))]
    pub fn build(
        &self,
        utxos: &[Utxo],
        outputs: Vec<TxOutput>,
        fee: FeePolicy,
    ) -> Result<UnsignedTransaction> {
        if outputs.is_empty() {
            return Err(KestrelError::ValidationError("no outputs".into()));
        }
        for (index, output) in outputs.iter().enumerate() {
            let threshold = output.dust_threshold();
            if output.amount < threshold {
                return Err(KestrelError::DustOutput {
                    index,
                    amount: output.amount,
                    threshold,
                });
            }
        }

        let costs = Costs {
            target: checked_sum(outputs.iter().map(|o| o.amount))?,
            base_vbytes: TX_OVERHEAD_VBYTES + outputs.iter().map(TxOutput::vbytes).sum::<u64>(),
            change_vbytes: self
                .change
                .as_ref()
                .map(|a| a.script_type().output_vbytes())
                .unwrap_or(0),
            change_dust: self
                .change
                .as_ref()
                .map(|a| a.script_type().dust_threshold())
                .unwrap_or(0),
            has_change: self.change.is_some(),
            fee,
        };

        let mut candidates: Vec<&Utxo> = utxos.iter().filter(|u| !u.is_dust()).collect();
        candidates.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.outpoint.cmp(&b.outpoint)));

        let selection = match self.config.strategy {
            SelectionStrategy::LargestFirst => None,
            SelectionStrategy::ExactMatch => self.exact_match(&candidates, &costs)?,
        };
        let selection = match selection {
            Some(s) => s,
            None => largest_first(&candidates, &costs)?,
        };

        let sequence = self.config.sequence();
        let inputs: Vec<TxInput> = selection
            .inputs
            .iter()
            .map(|u| TxInput::from_utxo(u, sequence))
            .collect();

        let mut outputs = outputs;
        let mut change_index = None;
        if selection.change > 0 {
            if let Some(change) = &self.change {
                outputs.push(TxOutput::to_address(change, selection.change));
                change_index = Some(outputs.len() - 1);
            }
        }

        debug!(
            inputs = inputs.len(),
            fee = selection.fee,
            change = selection.change,
            "Inputs selected"
        );
        UnsignedTransaction::new(inputs, outputs, selection.fee, self.config.lock_time, change_index)
    }

    /// Depth-first search for a subset whose excess over target plus fee is
    /// too small to be worth a change output.
    fn exact_match<'a>(&self, candidates: &[&'a Utxo], costs: &Costs) -> Result<Option<Selection<'a>>> {
        let window = costs.change_dust + costs.fee.fee_for(costs.change_vbytes)?;
        let mut suffix_sums = vec![0u64; candidates.len() + 1];
        for i in (0..candidates.len()).rev() {
            suffix_sums[i] = suffix_sums[i + 1].saturating_add(candidates[i].amount);
        }

        let mut chosen: Vec<usize> = Vec::new();
        let mut tries = 0usize;
        // Each frame is (next candidate, total so far, input vbytes so far,
        // length of `chosen` below this frame, candidate taken by this frame).
        let mut stack: Vec<(usize, u64, u64, usize, Option<usize>)> = vec![(0, 0, 0, 0, None)];

        while let Some((next, total, vbytes, depth, taken)) = stack.pop() {
            chosen.truncate(depth);
            if let Some(i) = taken {
                chosen.push(i);
            }
            tries += 1;
            if tries > self.config.max_exact_match_tries {
                debug!("Exact-match search budget exhausted");
                return Ok(None);
            }

            if total > 0 {
                let fee = costs.fee_without_change(vbytes)?;
                let floor = costs.target.saturating_add(fee);
                if total >= floor {
                    if total - floor < window {
                        let inputs = chosen.iter().map(|&i| candidates[i]).collect();
                        return Ok(Some(Selection {
                            inputs,
                            fee: total - costs.target,
                            change: 0,
                        }));
                    }
                    continue;
                }
            }
            if next >= candidates.len() || total.saturating_add(suffix_sums[next]) < costs.target {
                continue;
            }

            // Explore "skip next" after "take next".
            let depth = chosen.len();
            stack.push((next + 1, total, vbytes, depth, None));
            let utxo = candidates[next];
            stack.push((
                next + 1,
                total.saturating_add(utxo.amount),
                vbytes + utxo.input_vbytes(),
                depth,
                Some(next),
            ));
        }
        Ok(None)
    }
}

fn largest_first<'a>(candidates: &[&'a Utxo], costs: &Costs) -> Result<Selection<'a>> {
    let mut total = 0u64;
    let mut vbytes = 0u64;
    for (i, utxo) in candidates.iter().enumerate() {
        total = total.checked_add(utxo.amount).ok_or(KestrelError::AmountOverflow)?;
        vbytes += utxo.input_vbytes();
        if let Some((fee, change)) = costs.settle(total, vbytes)? {
            return Ok(Selection {
                inputs: candidates[..=i].to_vec(),
                fee,
                change,
            });
        }
    }

    let fee = costs.fee_without_change(vbytes)?;
    Err(KestrelError::InsufficientFunds {
        needed: costs.target.saturating_add(fee),
        available: total,
    })
}
