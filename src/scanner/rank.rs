//! Enrichment and risk ordering.
//!
//! Tiers: active Permit2 spenders, then other active approvals, then inactive.
//! Larger current value first within a tier; `(token, spender)` breaks ties so
//! the order is total.

use ethers::types::{Address, U256};
use std::cmp::Ordering;
use std::collections::HashMap;

use super::types::{
    ApprovalDeclaration, EnrichedApproval, LiveApprovalState, LiveValue, PairKey, TokenMetadata,
    PERMIT2_ADDRESS,
};

pub fn enrich(
    declarations: &[ApprovalDeclaration],
    live: &HashMap<PairKey, LiveApprovalState>,
    metadata: &HashMap<Address, TokenMetadata>,
    min_allowance: U256,
) -> Vec<EnrichedApproval> {
    declarations
        .iter()
        .map(|decl| {
            let (current_value, verified) = match live.get(&decl.key()) {
                Some(state) => (state.current_value, state.verified),
                None => (LiveValue::inactive_for(decl.standard), false),
            };
            EnrichedApproval {
                token: decl.token,
                spender: decl.spender,
                standard: decl.standard,
                declared_allowance: decl.declared_allowance,
                current_value,
                is_active: current_value.is_active(min_allowance),
                verified,
                is_permit2: decl.spender == PERMIT2_ADDRESS,
                metadata: metadata
                    .get(&decl.token)
                    .cloned()
                    .unwrap_or_else(|| TokenMetadata::placeholder(decl.token)),
                observed_at: decl.observed_at,
            }
        })
        .collect()
}

fn tier(a: &EnrichedApproval) -> u8 {
    match (a.is_active, a.is_permit2) {
        (true, true) => 0,
        (true, false) => 1,
        (false, _) => 2,
    }
}

pub fn risk_order(a: &EnrichedApproval, b: &EnrichedApproval) -> Ordering {
    tier(a)
        .cmp(&tier(b))
        .then_with(|| b.current_value.magnitude().cmp(&a.current_value.magnitude()))
        .then_with(|| a.key().cmp(&b.key()))
}

pub fn rank(approvals: &mut [EnrichedApproval]) {
    approvals.sort_by(risk_order);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::types::{LogPosition, TokenStandard};

    fn min() -> U256 {
        U256::from(100)
    }

    fn decl(token: u8, spender: Address, standard: TokenStandard) -> ApprovalDeclaration {
        ApprovalDeclaration {
            token: Address::repeat_byte(token),
            spender,
            declared_allowance: U256::MAX,
            standard,
            observed_at: LogPosition::default(),
        }
    }

    fn live(d: &ApprovalDeclaration, value: LiveValue) -> (PairKey, LiveApprovalState) {
        (
            d.key(),
            LiveApprovalState {
                token: d.token,
                spender: d.spender,
                current_value: value,
                is_active: value.is_active(min()),
                verified: true,
            },
        )
    }

    fn other() -> Address {
        Address::repeat_byte(0x77)
    }

    #[test]
    fn test_risk_tiers_in_any_input_order() {
        let p2_small = decl(1, PERMIT2_ADDRESS, TokenStandard::Erc20);
        let p2_big = decl(2, PERMIT2_ADDRESS, TokenStandard::Erc20);
        let active_small = decl(3, other(), TokenStandard::Erc20);
        let active_nft = decl(4, other(), TokenStandard::Erc1155);
        let inactive = decl(5, other(), TokenStandard::Erc20);
        let inactive_p2 = decl(6, PERMIT2_ADDRESS, TokenStandard::Erc20);

        let states: HashMap<_, _> = vec![
            live(&p2_small, LiveValue::Allowance(U256::from(1_000))),
            live(&p2_big, LiveValue::Allowance(U256::from(10_000))),
            live(&active_small, LiveValue::Allowance(U256::from(500))),
            live(&active_nft, LiveValue::Operator(true)),
            live(&inactive, LiveValue::Allowance(U256::zero())),
            live(&inactive_p2, LiveValue::Allowance(U256::from(5))),
        ]
        .into_iter()
        .collect();

        let inputs = vec![
            inactive.clone(),
            active_small.clone(),
            p2_small.clone(),
            inactive_p2.clone(),
            active_nft.clone(),
            p2_big.clone(),
        ];
        let mut reversed = inputs.clone();
        reversed.reverse();

        for input in [inputs, reversed] {
            let mut out = enrich(&input, &states, &HashMap::new(), min());
            rank(&mut out);
            let tokens: Vec<u8> = out.iter().map(|a| a.token.0[0]).collect();
            // Permit2 by value, then others (operator = unlimited first), then inactive
            assert_eq!(tokens, vec![2, 1, 4, 3, 6, 5]);
        }
    }

    #[test]
    fn test_enrich_flags_and_metadata() {
        let d = decl(9, PERMIT2_ADDRESS, TokenStandard::Erc20);
        let states: HashMap<_, _> = vec![live(&d, LiveValue::Allowance(U256::from(100)))]
            .into_iter()
            .collect();
        let mut meta = HashMap::new();
        meta.insert(
            d.token,
            TokenMetadata {
                address: d.token,
                symbol: "WETH".into(),
                name: "Wrapped Ether".into(),
                decimals: 18,
            },
        );
        let out = enrich(&[d], &states, &meta, min());
        assert!(out[0].is_permit2);
        assert!(out[0].is_active);
        assert_eq!(out[0].metadata.symbol, "WETH");
    }

    #[test]
    fn test_missing_live_state_is_inactive_and_unverified() {
        let d = decl(9, other(), TokenStandard::Erc721);
        let out = enrich(&[d], &HashMap::new(), &HashMap::new(), min());
        assert!(!out[0].is_active);
        assert!(!out[0].verified);
        assert_eq!(out[0].current_value, LiveValue::Operator(false));
        assert!(out[0].metadata.is_placeholder());
    }
}
