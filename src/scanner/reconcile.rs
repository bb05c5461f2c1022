//! Log reconciliation: chronological replay, last write wins per `(token, spender)`.

use ethers::types::{Address, U256};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::hypersync::{RawLog, APPROVAL_FOR_ALL_TOPIC, APPROVAL_TOPIC};
use super::types::{ApprovalDeclaration, LogPosition, PairKey, TokenStandard, MAX_FOR_ALL};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// One entry per pair, ordered by `observed_at`.
    pub declarations: Vec<ApprovalDeclaration>,
    /// Logs whose payload or key could not be decoded.
    pub decode_failures: usize,
    /// Logs that are not allowance or operator approvals (ERC721 single-token
    /// `Approval`, foreign topics).
    pub skipped: usize,
}

enum EventKind {
    Allowance,
    OperatorForAll,
}

fn event_kind(log: &RawLog) -> Option<EventKind> {
    let topic0 = log.topic0.as_deref()?.to_ascii_lowercase();
    if topic0 == APPROVAL_TOPIC {
        // ERC721 Approval shares topic0 but indexes the token id as topic3
        if log.topic3.is_some() {
            return None;
        }
        Some(EventKind::Allowance)
    } else if topic0 == APPROVAL_FOR_ALL_TOPIC {
        Some(EventKind::OperatorForAll)
    } else {
        None
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).ok()
}

fn parse_address(s: &str) -> Option<Address> {
    let bytes = decode_hex(s)?;
    (bytes.len() == 20).then(|| Address::from_slice(&bytes))
}

/// Address from the low 20 bytes of a 32-byte topic.
fn parse_topic_address(s: &str) -> Option<Address> {
    let bytes = decode_hex(s)?;
    (bytes.len() == 32).then(|| Address::from_slice(&bytes[12..]))
}

/// `None` on malformed data. Empty data is a zero allowance.
fn decode_word(data: Option<&str>) -> Option<U256> {
    let bytes = decode_hex(data.unwrap_or("0x"))?;
    if bytes.len() > 32 {
        return None;
    }
    Some(U256::from_big_endian(&bytes))
}

fn position(log: &RawLog) -> LogPosition {
    LogPosition::new(
        log.block_number.unwrap_or(0),
        log.transaction_index.unwrap_or(0),
        log.log_index.unwrap_or(0),
    )
}

/// Replay `logs` in `(block, tx index, log index)` order and keep the latest
/// declaration per pair. ERC20 pairs below `min_allowance` are dropped; operator
/// approvals never are.
pub fn reconcile(logs: &[RawLog], min_allowance: U256) -> ReconcileOutcome {
    let mut ordered: Vec<&RawLog> = logs.iter().collect();
    // Full-content tie-break keeps the result independent of input order even
    // when the indexer omits positions.
    ordered.sort_by(|a, b| {
        position(a).cmp(&position(b)).then_with(|| {
            (&a.address, &a.topic0, &a.topic2, &a.data).cmp(&(&b.address, &b.topic0, &b.topic2, &b.data))
        })
    });

    let mut latest: HashMap<PairKey, ApprovalDeclaration> = HashMap::new();
    let mut decode_failures = 0usize;
    let mut skipped = 0usize;

    for log in ordered {
        let Some(kind) = event_kind(log) else {
            skipped += 1;
            continue;
        };

        let token = log.address.as_deref().and_then(parse_address);
        let spender = log.topic2.as_deref().and_then(parse_topic_address);
        let (Some(token), Some(spender)) = (token, spender) else {
            decode_failures += 1;
            debug!("[RECONCILE] Unkeyable log at {:?}", position(log));
            continue;
        };

        let word = decode_word(log.data.as_deref());
        if word.is_none() {
            decode_failures += 1;
            warn!(
                "[RECONCILE] Malformed data for {:?}/{:?}; treating as revoked",
                token, spender
            );
        }

        let (declared_allowance, standard) = match kind {
            EventKind::Allowance => (word.unwrap_or_default(), TokenStandard::Erc20),
            EventKind::OperatorForAll => {
                let approved = word.map(|w| !w.is_zero()).unwrap_or(false);
                let value = if approved { MAX_FOR_ALL } else { U256::zero() };
                // ERC721 until the classifier says otherwise
                (value, TokenStandard::Erc721)
            }
        };

        latest.insert(
            (token, spender),
            ApprovalDeclaration {
                token,
                spender,
                declared_allowance,
                standard,
                observed_at: position(log),
            },
        );
    }

    let mut declarations: Vec<ApprovalDeclaration> = latest
        .into_values()
        .filter(|d| d.standard.is_nft() || d.declared_allowance >= min_allowance)
        .collect();
    declarations.sort_by(|a, b| a.observed_at.cmp(&b.observed_at).then_with(|| a.key().cmp(&b.key())));

    ReconcileOutcome {
        declarations,
        decode_failures,
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::hypersync::owner_topic;

    const MIN: u64 = 100;

    fn token_a() -> Address {
        Address::repeat_byte(0xa1)
    }
    fn spender_x() -> Address {
        Address::repeat_byte(0x55)
    }
    fn owner() -> Address {
        Address::repeat_byte(0x0e)
    }

    fn word(v: u64) -> String {
        format!("0x{:064x}", v)
    }

    fn approval(token: Address, spender: Address, value: u64, block: u64, tx: u64, idx: u64) -> RawLog {
        RawLog {
            address: Some(format!("{:?}", token)),
            topic0: Some(APPROVAL_TOPIC.to_string()),
            topic1: Some(owner_topic(owner())),
            topic2: Some(owner_topic(spender)),
            topic3: None,
            data: Some(word(value)),
            log_index: Some(idx),
            transaction_index: Some(tx),
            block_number: Some(block),
        }
    }

    fn for_all(token: Address, operator: Address, approved: bool, block: u64) -> RawLog {
        RawLog {
            topic0: Some(APPROVAL_FOR_ALL_TOPIC.to_string()),
            data: Some(word(approved as u64)),
            ..approval(token, operator, 0, block, 0, 0)
        }
    }

    fn reconcile_min(logs: &[RawLog]) -> ReconcileOutcome {
        reconcile(logs, U256::from(MIN))
    }

    #[test]
    fn test_revoked_by_later_zero() {
        let logs = vec![
            approval(token_a(), spender_x(), 100, 1, 0, 0),
            approval(token_a(), spender_x(), 0, 2, 0, 0),
        ];
        let out = reconcile(&logs, U256::zero());
        assert_eq!(out.declarations.len(), 1);
        assert!(out.declarations[0].declared_allowance.is_zero());
        // and dust-filtered away under the default floor
        assert!(reconcile_min(&logs).declarations.is_empty());
    }

    #[test]
    fn test_latest_position_wins_regardless_of_input_order() {
        let early = approval(token_a(), spender_x(), 500, 7, 3, 9);
        let same_block_later_tx = approval(token_a(), spender_x(), 700, 7, 4, 0);
        let same_tx_later_log = approval(token_a(), spender_x(), 900, 7, 4, 1);

        let forward = vec![early.clone(), same_block_later_tx.clone(), same_tx_later_log.clone()];
        let shuffled = vec![same_tx_later_log, early, same_block_later_tx];

        let a = reconcile_min(&forward);
        let b = reconcile_min(&shuffled);
        assert_eq!(a, b);
        assert_eq!(a.declarations[0].declared_allowance, U256::from(900));
        assert_eq!(a.declarations[0].observed_at, LogPosition::new(7, 4, 1));
    }

    #[test]
    fn test_idempotent() {
        let logs = vec![
            approval(token_a(), spender_x(), 1_000, 3, 0, 0),
            approval(Address::repeat_byte(0xb2), spender_x(), 5, 4, 0, 0),
            for_all(Address::repeat_byte(0xc3), spender_x(), true, 5),
            approval(token_a(), Address::repeat_byte(0x66), 250, 2, 1, 1),
        ];
        let once = reconcile_min(&logs);
        let twice = reconcile_min(&logs);
        assert_eq!(once, twice);
        assert_eq!(once.declarations.len(), 3);
    }

    #[test]
    fn test_approval_for_all_true_then_false() {
        let collection = Address::repeat_byte(0xc3);
        let logs = vec![
            for_all(collection, spender_x(), false, 9),
            for_all(collection, spender_x(), true, 8),
        ];
        let out = reconcile_min(&logs);
        assert_eq!(out.declarations.len(), 1);
        let d = &out.declarations[0];
        assert!(d.declared_allowance.is_zero());
        assert_eq!(d.standard, TokenStandard::Erc721);
    }

    #[test]
    fn test_approval_for_all_true_is_sentinel() {
        let out = reconcile_min(&[for_all(Address::repeat_byte(0xc3), spender_x(), true, 1)]);
        assert_eq!(out.declarations[0].declared_allowance, MAX_FOR_ALL);
    }

    #[test]
    fn test_dust_filter_only_applies_to_erc20() {
        let logs = vec![
            approval(token_a(), spender_x(), 99, 1, 0, 0),
            approval(Address::repeat_byte(0xb2), spender_x(), 100, 1, 0, 1),
            for_all(Address::repeat_byte(0xc3), spender_x(), false, 2),
        ];
        let out = reconcile_min(&logs);
        let tokens: Vec<Address> = out.declarations.iter().map(|d| d.token).collect();
        assert!(!tokens.contains(&token_a()));
        assert!(tokens.contains(&Address::repeat_byte(0xb2)));
        assert!(tokens.contains(&Address::repeat_byte(0xc3)));
    }

    #[test]
    fn test_malformed_data_is_revoked_not_fatal() {
        let mut bad = approval(token_a(), spender_x(), 0, 5, 0, 0);
        bad.data = Some("0xzz".into());
        let logs = vec![approval(token_a(), spender_x(), 10_000, 1, 0, 0), bad];

        let out = reconcile(&logs, U256::zero());
        assert_eq!(out.decode_failures, 1);
        assert_eq!(out.declarations.len(), 1);
        assert!(out.declarations[0].declared_allowance.is_zero());
    }

    #[test]
    fn test_empty_data_is_zero() {
        let mut log = approval(token_a(), spender_x(), 0, 1, 0, 0);
        log.data = Some("0x".into());
        let out = reconcile(&[log], U256::zero());
        assert_eq!(out.decode_failures, 0);
        assert!(out.declarations[0].declared_allowance.is_zero());
    }

    #[test]
    fn test_unkeyable_and_foreign_logs() {
        let mut no_spender = approval(token_a(), spender_x(), 500, 1, 0, 0);
        no_spender.topic2 = None;
        let mut erc721_single = approval(token_a(), spender_x(), 0, 1, 0, 1);
        erc721_single.topic3 = Some(word(42));
        let mut foreign = approval(token_a(), spender_x(), 500, 1, 0, 2);
        foreign.topic0 = Some(format!("0x{}", "11".repeat(32)));

        let out = reconcile_min(&[no_spender, erc721_single, foreign]);
        assert!(out.declarations.is_empty());
        assert_eq!(out.decode_failures, 1);
        assert_eq!(out.skipped, 2);
    }

    #[test]
    fn test_uppercase_topic_accepted() {
        let mut log = approval(token_a(), spender_x(), 500, 1, 0, 0);
        log.topic0 = log.topic0.map(|t| t.to_uppercase().replace("0X", "0x"));
        assert_eq!(reconcile_min(&[log]).declarations.len(), 1);
    }
}
