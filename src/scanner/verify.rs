//! Live-state verification: the chain, not the log stream, decides what is active.

use ethers::types::{Address, U256};
use std::collections::HashMap;
use tracing::{info, warn};

use super::reads::{read_chunked, ContractReader, ReadCall, ReadValue};
use super::types::{ApprovalDeclaration, LiveApprovalState, LiveValue, PairKey, ScanWarning};

#[derive(Debug, Clone, Default)]
pub struct VerifyOutcome {
    pub states: HashMap<PairKey, LiveApprovalState>,
    pub total_reads: usize,
    pub failed_reads: usize,
    pub warnings: Vec<ScanWarning>,
}

#[derive(Debug, Clone, Copy)]
pub struct VerifyParams {
    pub min_allowance: U256,
    pub chunk_size: usize,
    /// All-zero results across at least this many reads look like a stale node.
    pub stale_min_batch: usize,
}

fn read_call(owner: Address, decl: &ApprovalDeclaration) -> ReadCall {
    if decl.standard.is_nft() {
        ReadCall::IsApprovedForAll {
            token: decl.token,
            owner,
            operator: decl.spender,
        }
    } else {
        ReadCall::Allowance {
            token: decl.token,
            owner,
            spender: decl.spender,
        }
    }
}

fn live_value(decl: &ApprovalDeclaration, value: Option<&ReadValue>) -> Option<LiveValue> {
    let value = value?;
    if decl.standard.is_nft() {
        value.as_bool().map(LiveValue::Operator)
    } else {
        value.as_uint().map(LiveValue::Allowance)
    }
}

/// Read `allowance` / `isApprovedForAll` for every declaration. A failed read
/// resolves to the inactive value with `verified = false`.
pub async fn verify_live_state(
    reader: &dyn ContractReader,
    chain: &str,
    owner: Address,
    declarations: &[ApprovalDeclaration],
    params: VerifyParams,
) -> VerifyOutcome {
    let calls: Vec<ReadCall> = declarations.iter().map(|d| read_call(owner, d)).collect();
    let reads = read_chunked(reader, chain, &calls, params.chunk_size).await;

    let mut outcome = VerifyOutcome {
        total_reads: calls.len(),
        ..Default::default()
    };

    for (decl, value) in declarations.iter().zip(reads.values.iter()) {
        let (current_value, verified) = match live_value(decl, value.as_ref()) {
            Some(v) => (v, true),
            None => {
                outcome.failed_reads += 1;
                (LiveValue::inactive_for(decl.standard), false)
            }
        };
        outcome.states.insert(
            decl.key(),
            LiveApprovalState {
                token: decl.token,
                spender: decl.spender,
                current_value,
                is_active: current_value.is_active(params.min_allowance),
                verified,
            },
        );
    }

    if outcome.failed_reads > 0 {
        warn!(
            "[VERIFY] {} {}/{} reads failed ({} chunk(s)); defaulted to inactive",
            chain, outcome.failed_reads, outcome.total_reads, reads.failed_chunks
        );
        outcome.warnings.push(ScanWarning::ReadFailures {
            failed: outcome.failed_reads,
            total: outcome.total_reads,
        });
    }

    let all_zero = outcome
        .states
        .values()
        .all(|s| s.current_value.magnitude().is_zero());
    if all_zero && outcome.total_reads >= params.stale_min_batch.max(1) {
        warn!(
            "[VERIFY] {} all {} live reads returned zero; RPC may be stale",
            chain, outcome.total_reads
        );
        outcome.warnings.push(ScanWarning::StaleData {
            reads: outcome.total_reads,
        });
    }

    info!(
        "[VERIFY] {} {} pairs checked, {} active",
        chain,
        outcome.total_reads,
        outcome.states.values().filter(|s| s.is_active).count()
    );
    outcome
}
