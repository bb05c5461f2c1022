//! Batch revocation through an EIP-7702 delegated self-transaction.
//!
//! Idle → CheckingDelegation → (SigningAuthorization) → Submitting → Confirming
//!      → (ClearingDelegation) → Done, with Failed reachable from any
//! non-terminal state. Every planned call goes back through
//! CheckingDelegation, so only the first call of a split plan needs a fresh
//! authorization. States are published on a watch channel.

use ethers::types::{Address, Bytes, H256, U256};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{ChainConfig, RevokeSettings};
use crate::error::{RevokeError, RevokeResult};
use crate::metrics::Metrics;
use crate::scanner::types::{EnrichedApproval, PairKey};
use super::authorization::{Authorization, DelegationStatus, SignedAuthorization};
use super::chain::{AccountChain, AuthorizingWallet};
use super::plan::{plan_revocation, CallKind, DelegateCall};
use super::tx::{self, gas_limit, UnsignedTx};

// ─── State Machine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RevokeState {
    Idle,
    CheckingDelegation,
    SigningAuthorization { delegate: Address },
    Submitting { kind: CallKind, items: usize },
    Confirming { tx_hash: H256 },
    ClearingDelegation,
    Done { revoked: usize },
    Failed { message: String },
}

impl RevokeState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CheckingDelegation => "checking_delegation",
            Self::SigningAuthorization { .. } => "signing_authorization",
            Self::Submitting { .. } => "submitting",
            Self::Confirming { .. } => "confirming",
            Self::ClearingDelegation => "clearing_delegation",
            Self::Done { .. } => "done",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed { .. })
    }

    pub fn can_transition_to(&self, next: &RevokeState) -> bool {
        use RevokeState::*;
        match (self, next) {
            (s, Failed { .. }) => !s.is_terminal(),
            (Done { .. } | Failed { .. }, Idle) => true,
            (Idle, CheckingDelegation) => true,
            (Idle, ClearingDelegation) => true,
            (CheckingDelegation, SigningAuthorization { .. }) => true,
            (CheckingDelegation, Submitting { .. }) => true,
            (SigningAuthorization { .. }, Submitting { .. }) => true,
            (Submitting { .. }, Confirming { .. }) => true,
            (Confirming { .. }, CheckingDelegation) => true,
            (Confirming { .. }, ClearingDelegation) => true,
            (Confirming { .. }, Done { .. }) => true,
            (ClearingDelegation, Done { .. }) => true,
            _ => false,
        }
    }

    pub fn status_message(&self) -> String {
        match self {
            Self::Idle => "Ready".to_string(),
            Self::CheckingDelegation => "Checking account delegation...".to_string(),
            Self::SigningAuthorization { .. } => {
                "Sign the authorization to delegate your account for this transaction".to_string()
            }
            Self::Submitting { kind, items } => {
                format!("Submitting {} for {} approval(s)...", kind, items)
            }
            Self::Confirming { tx_hash } => format!("Waiting for confirmation of {:?}...", tx_hash),
            Self::ClearingDelegation => "Clearing account delegation...".to_string(),
            Self::Done { revoked } => format!("Revoked {} approval(s)", revoked),
            Self::Failed { message } => message.clone(),
        }
    }
}

// ─── Outcome ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedCall {
    pub kind: CallKind,
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub pairs: Vec<PairKey>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RevokeOutcome {
    pub completed: Vec<CompletedCall>,
    /// Non-fatal problems, e.g. a delegation clear that did not land.
    pub warnings: Vec<String>,
}

impl RevokeOutcome {
    pub fn revoked_pairs(&self) -> Vec<PairKey> {
        self.completed.iter().flat_map(|c| c.pairs.iter().copied()).collect()
    }
}

/// A failed run, with whatever calls confirmed before the failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RevokeFailure {
    #[source]
    pub error: RevokeError,
    pub completed: Vec<CompletedCall>,
}

impl RevokeFailure {
    pub fn revoked_pairs(&self) -> Vec<PairKey> {
        self.completed.iter().flat_map(|c| c.pairs.iter().copied()).collect()
    }
}

fn outcome_label(e: &RevokeError) -> &'static str {
    match e {
        RevokeError::SignatureRejected(_) => "rejected",
        RevokeError::TransactionReverted { .. } => "reverted",
        RevokeError::TransactionDropped { .. } => "dropped",
        RevokeError::NothingToRevoke => "empty",
        _ => "failed",
    }
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

pub struct RevokeOrchestrator {
    chain_key: String,
    delegate: Address,
    supports_revoke_all: bool,
    settings: RevokeSettings,
    chain: Arc<dyn AccountChain>,
    wallet: Arc<dyn AuthorizingWallet>,
    metrics: Arc<Metrics>,
    state: watch::Sender<RevokeState>,
}

impl RevokeOrchestrator {
    pub fn new(
        config: &ChainConfig,
        settings: RevokeSettings,
        chain: Arc<dyn AccountChain>,
        wallet: Arc<dyn AuthorizingWallet>,
        metrics: Arc<Metrics>,
    ) -> RevokeResult<Self> {
        let delegate = config
            .delegate
            .ok_or_else(|| RevokeError::NoDelegate(config.name.clone()))?;
        let (state, _) = watch::channel(RevokeState::Idle);
        Ok(Self {
            chain_key: config.key.clone(),
            delegate,
            supports_revoke_all: config.delegate_supports_revoke_all,
            settings,
            chain,
            wallet,
            metrics,
            state,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<RevokeState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RevokeState {
        self.state.borrow().clone()
    }

    pub fn owner(&self) -> Address {
        self.wallet.address()
    }

    fn transition(&self, next: RevokeState) -> RevokeResult<()> {
        let current = self.state();
        if !current.can_transition_to(&next) {
            error!(
                "[REVOKE] Illegal transition {} -> {}",
                current.name(),
                next.name()
            );
            return Err(RevokeError::InvalidTransition {
                from: current.name(),
                to: next.name(),
            });
        }
        info!("[REVOKE] {} -> {}", current.name(), next.name());
        self.state.send_replace(next);
        Ok(())
    }

    fn reset(&self) {
        if self.state().is_terminal() {
            self.state.send_replace(RevokeState::Idle);
        }
    }

    fn fail(&self, error: RevokeError, completed: Vec<CompletedCall>) -> RevokeFailure {
        error!(
            "[REVOKE] {} failed after {} confirmed call(s): {}",
            self.chain_key,
            completed.len(),
            error
        );
        self.metrics
            .record_revocation(&self.chain_key, outcome_label(&error));
        if !self.state().is_terminal() {
            self.state.send_replace(RevokeState::Failed {
                message: error.user_message(),
            });
        }
        RevokeFailure { error, completed }
    }

    /// Revoke every active approval in `candidates` in as few transactions as
    /// the delegate allows.
    pub async fn run(&self, candidates: &[EnrichedApproval]) -> Result<RevokeOutcome, RevokeFailure> {
        self.reset();
        let calls = plan_revocation(candidates, self.supports_revoke_all)
            .map_err(|e| self.fail(e, Vec::new()))?;
        info!(
            "[REVOKE] {} plan: {} call(s) for {} pair(s)",
            self.chain_key,
            calls.len(),
            calls.iter().map(DelegateCall::item_count).sum::<usize>()
        );

        let mut outcome = RevokeOutcome::default();
        for call in &calls {
            match self.execute_call(call).await {
                Ok(done) => outcome.completed.push(done),
                Err(e) => return Err(self.fail(e, outcome.completed)),
            }
        }

        if self.settings.clear_delegation {
            if let Err(e) = self.transition(RevokeState::ClearingDelegation) {
                return Err(self.fail(e, outcome.completed));
            }
            match self.clear_inner().await {
                Ok(Some(done)) => outcome.completed.push(done),
                Ok(None) => {}
                Err(e) => {
                    warn!("[REVOKE] {} delegation clear failed: {}", self.chain_key, e);
                    outcome
                        .warnings
                        .push(format!("Approvals revoked, but the delegation was not cleared: {}", e.user_message()));
                }
            }
        }

        let revoked = outcome.revoked_pairs().len();
        if let Err(e) = self.transition(RevokeState::Done { revoked }) {
            return Err(self.fail(e, outcome.completed));
        }
        self.metrics.record_revocation(&self.chain_key, "confirmed");
        info!("[REVOKE] {} revoked {} approval(s)", self.chain_key, revoked);
        Ok(outcome)
    }

    /// Restore the account to a plain EOA without revoking anything.
    pub async fn clear_delegation(&self) -> Result<Option<CompletedCall>, RevokeFailure> {
        self.reset();
        self.transition(RevokeState::ClearingDelegation)
            .map_err(|e| self.fail(e, Vec::new()))?;
        let done = self.clear_inner().await.map_err(|e| self.fail(e, Vec::new()))?;
        self.transition(RevokeState::Done { revoked: 0 })
            .map_err(|e| self.fail(e, Vec::new()))?;
        Ok(done)
    }

    pub async fn delegation_status(&self) -> RevokeResult<DelegationStatus> {
        let code = self.chain.get_code(self.owner()).await?;
        Ok(DelegationStatus::from_code(&code))
    }

    async fn execute_call(&self, call: &DelegateCall) -> RevokeResult<CompletedCall> {
        self.transition(RevokeState::CheckingDelegation)?;
        let owner = self.owner();
        let status = self.delegation_status().await?;
        let nonce = self.chain.nonce(owner).await?;

        let mut authorizations = Vec::new();
        match status {
            s if s.is_delegated_to(self.delegate) => {
                info!("[REVOKE] {:?} already delegated; skipping authorization", owner);
            }
            DelegationStatus::Contract => {
                return Err(RevokeError::Chain(format!(
                    "{:?} has contract code and cannot be delegated",
                    owner
                )));
            }
            _ => {
                self.transition(RevokeState::SigningAuthorization {
                    delegate: self.delegate,
                })?;
                authorizations.push(self.authorize(self.delegate, nonce).await?);
            }
        }

        self.transition(RevokeState::Submitting {
            kind: call.kind(),
            items: call.item_count(),
        })?;
        let tx_hash = self
            .submit(nonce, call.calldata(), call.item_count(), authorizations)
            .await?;

        self.transition(RevokeState::Confirming { tx_hash })?;
        let receipt = self.chain.wait_receipt(tx_hash).await?;
        if !receipt.success {
            return Err(RevokeError::TransactionReverted { tx_hash });
        }
        info!(
            "[REVOKE] {} confirmed in block {:?}",
            call.kind(),
            receipt.block_number
        );
        Ok(CompletedCall {
            kind: call.kind(),
            tx_hash,
            block_number: receipt.block_number,
            pairs: call.pairs(),
        })
    }

    /// Authorize the zero address in an empty self-transaction. `None` when
    /// the account carries no delegation. Runs entirely in ClearingDelegation.
    async fn clear_inner(&self) -> RevokeResult<Option<CompletedCall>> {
        let owner = self.owner();
        match self.delegation_status().await? {
            DelegationStatus::NotDelegated => {
                info!("[REVOKE] {:?} not delegated; nothing to clear", owner);
                return Ok(None);
            }
            DelegationStatus::Contract => {
                return Err(RevokeError::Chain(format!(
                    "{:?} has contract code and cannot be cleared",
                    owner
                )));
            }
            DelegationStatus::Delegated(_) => {}
        }

        let nonce = self.chain.nonce(owner).await?;
        let auth = self.authorize(Address::zero(), nonce).await?;
        let tx_hash = self.submit(nonce, Bytes::new(), 0, vec![auth]).await?;
        let receipt = self.chain.wait_receipt(tx_hash).await?;
        if !receipt.success {
            return Err(RevokeError::TransactionReverted { tx_hash });
        }
        info!("[REVOKE] {:?} delegation cleared in {:?}", owner, tx_hash);
        Ok(Some(CompletedCall {
            kind: CallKind::ClearDelegation,
            tx_hash,
            block_number: receipt.block_number,
            pairs: Vec::new(),
        }))
    }

    /// The sender nonce is consumed before the authorization list is
    /// processed, so a self-executed authorization carries `nonce + 1`.
    async fn authorize(&self, target: Address, account_nonce: u64) -> RevokeResult<SignedAuthorization> {
        let auth = Authorization::new(self.chain.chain_id(), target, account_nonce + 1);
        let sig = self
            .wallet
            .sign_authorization(&auth, self.settings.authorization_scheme)
            .await?;
        Ok(SignedAuthorization::from_signature(auth, sig))
    }

    async fn submit(
        &self,
        nonce: u64,
        data: Bytes,
        items: usize,
        authorizations: Vec<SignedAuthorization>,
    ) -> RevokeResult<H256> {
        let fees = self.chain.fees().await?;
        let tx = UnsignedTx {
            chain_id: self.chain.chain_id(),
            nonce,
            fees,
            gas_limit: gas_limit(&self.settings, items, authorizations.len()),
            to: self.owner(),
            value: U256::zero(),
            data,
            authorizations,
        };
        let sig = self.wallet.sign_transaction_hash(tx.signing_hash()).await?;
        let raw = tx.encode_signed(&sig)?;
        let expected = tx::raw_tx_hash(&raw);
        let tx_hash = self.chain.send_raw(raw).await?;
        if tx_hash != expected {
            warn!(
                "[REVOKE] node reported {:?}, expected {:?}",
                tx_hash, expected
            );
        }
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use crate::revoke::authorization::delegation_code;
    use crate::revoke::plan;
    use crate::revoke::chain::{LocalAuthorizingWallet, MockAuthorizingWallet, ReceiptSummary};
    use crate::revoke::tx::{decode_signed, DecodedTx, FeeEstimate, EIP1559_TX_TYPE, SET_CODE_TX_TYPE};
    use super::*;
    use crate::config::{default_chains, AuthorizationScheme};
    use crate::scanner::types::{LiveValue, LogPosition, TokenMetadata, TokenStandard};
    use async_trait::async_trait;
    use ethers::abi::{self, ParamType};
    use ethers::utils::id;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const CHAIN_ID: u64 = 11155111;

    fn sepolia() -> ChainConfig {
        default_chains()
            .into_iter()
            .find(|c| c.key == "sepolia")
            .expect("sepolia")
    }

    #[derive(Default)]
    struct FakeState {
        code: HashMap<Address, Vec<u8>>,
        nonces: HashMap<Address, u64>,
        sent: Vec<DecodedTx>,
        receipts: HashMap<H256, bool>,
        revert: bool,
        fail_send_from: Option<usize>,
    }

    /// Applies authorization lists the way a 7702 node would: sender nonce
    /// first, then each authorization whose nonce matches.
    struct FakeChain {
        sender: Address,
        scheme: AuthorizationScheme,
        state: StdMutex<FakeState>,
    }

    impl FakeChain {
        fn new(sender: Address) -> Self {
            Self {
                sender,
                scheme: AuthorizationScheme::Eip712,
                state: StdMutex::new(FakeState::default()),
            }
        }

        fn sent(&self) -> Vec<DecodedTx> {
            self.state.lock().expect("lock").sent.clone()
        }

        fn code_of(&self, who: Address) -> Vec<u8> {
            self.state
                .lock()
                .expect("lock")
                .code
                .get(&who)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl AccountChain for FakeChain {
        fn chain_id(&self) -> u64 {
            CHAIN_ID
        }

        async fn get_code(&self, address: Address) -> RevokeResult<Vec<u8>> {
            Ok(self.code_of(address))
        }

        async fn nonce(&self, address: Address) -> RevokeResult<u64> {
            Ok(*self.state.lock().expect("lock").nonces.get(&address).unwrap_or(&0))
        }

        async fn fees(&self) -> RevokeResult<FeeEstimate> {
            Ok(FeeEstimate {
                max_fee_per_gas: U256::from(2_000_000_000u64),
                max_priority_fee_per_gas: U256::from(100_000_000u64),
            })
        }

        async fn send_raw(&self, raw: Bytes) -> RevokeResult<H256> {
            let decoded = decode_signed(&raw).map_err(|e| RevokeError::Submission(e.to_string()))?;
            let mut st = self.state.lock().expect("lock");
            if st.fail_send_from.is_some_and(|n| st.sent.len() >= n) {
                return Err(RevokeError::Submission("replacement underpriced".into()));
            }
            let nonce = st.nonces.entry(self.sender).or_insert(0);
            if decoded.nonce != *nonce {
                return Err(RevokeError::Submission("nonce too low".into()));
            }
            *nonce += 1;

            for auth in &decoded.authorizations {
                let authority = auth.recover_authority(self.scheme).expect("authority");
                let current = *st.nonces.get(&authority).unwrap_or(&0);
                if auth.authorization.chain_id != CHAIN_ID || auth.authorization.nonce != current {
                    continue;
                }
                if auth.authorization.is_clear() {
                    st.code.remove(&authority);
                } else {
                    st.code
                        .insert(authority, delegation_code(auth.authorization.address));
                }
                st.nonces.insert(authority, current + 1);
            }

            let hash = tx::raw_tx_hash(&raw);
            let ok = !st.revert;
            st.receipts.insert(hash, ok);
            st.sent.push(decoded);
            Ok(hash)
        }

        async fn wait_receipt(&self, tx_hash: H256) -> RevokeResult<ReceiptSummary> {
            let st = self.state.lock().expect("lock");
            match st.receipts.get(&tx_hash) {
                Some(&success) => Ok(ReceiptSummary {
                    tx_hash,
                    block_number: Some(100 + st.sent.len() as u64),
                    success,
                }),
                None => Err(RevokeError::TransactionDropped { tx_hash }),
            }
        }
    }

    fn candidate(token: u8, spender: u8, standard: TokenStandard) -> EnrichedApproval {
        let token = Address::repeat_byte(token);
        EnrichedApproval {
            token,
            spender: Address::repeat_byte(spender),
            standard,
            declared_allowance: U256::MAX,
            current_value: if standard.is_nft() {
                LiveValue::Operator(true)
            } else {
                LiveValue::Allowance(U256::MAX)
            },
            is_active: true,
            verified: true,
            is_permit2: false,
            metadata: TokenMetadata::placeholder(token),
            observed_at: LogPosition::default(),
        }
    }

    fn mixed() -> Vec<EnrichedApproval> {
        vec![
            candidate(1, 0xa1, TokenStandard::Erc20),
            candidate(2, 0xa1, TokenStandard::Erc20),
            candidate(3, 0xa2, TokenStandard::Erc20),
            candidate(4, 0xb1, TokenStandard::Erc1155),
            candidate(5, 0xb2, TokenStandard::Erc1155),
        ]
    }

    fn setup(settings: RevokeSettings, config: ChainConfig) -> (Arc<FakeChain>, Arc<Metrics>, RevokeOrchestrator) {
        let wallet = Arc::new(LocalAuthorizingWallet::from_private_key(KEY).expect("wallet"));
        let chain = Arc::new(FakeChain::new(wallet.address()));
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let orch = RevokeOrchestrator::new(&config, settings, chain.clone(), wallet, metrics.clone())
            .expect("orchestrator");
        (chain, metrics, orch)
    }

    #[tokio::test]
    async fn test_mixed_set_one_revoke_all_transaction() {
        let (chain, metrics, orch) = setup(RevokeSettings::default(), sepolia());
        let outcome = orch.run(&mixed()).await.expect("run");

        let sent = chain.sent();
        assert_eq!(sent.len(), 1);
        let tx = &sent[0];
        assert_eq!(tx.tx_type, SET_CODE_TX_TYPE);
        assert_eq!(tx.to, orch.owner());
        assert_eq!(tx.authorizations.len(), 1);
        assert_eq!(tx.authorizations[0].authorization.nonce, tx.nonce + 1);
        assert_eq!(&tx.data[..4], &id(plan::REVOKE_ALL_SIG));

        let types = vec![ParamType::Array(Box::new(ParamType::Address)); 4];
        let arrays = abi::decode(&types, &tx.data[4..]).expect("abi");
        let lens: Vec<usize> = arrays
            .into_iter()
            .map(|t| t.into_array().expect("array").len())
            .collect();
        assert_eq!(lens, vec![3, 3, 2, 2]);

        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(outcome.revoked_pairs().len(), 5);
        assert_eq!(orch.state(), RevokeState::Done { revoked: 5 });
        assert!(orch
            .delegation_status()
            .await
            .expect("status")
            .is_delegated_to(sepolia().delegate.expect("delegate")));
        assert!(metrics
            .render()
            .contains("sweeper_revocations_total{chain=\"sepolia\",outcome=\"confirmed\"} 1"));
    }

    #[tokio::test]
    async fn test_clear_delegation_reads_back_empty_code() {
        let settings = RevokeSettings {
            clear_delegation: true,
            ..RevokeSettings::default()
        };
        let (chain, _, orch) = setup(settings, sepolia());
        let outcome = orch.run(&mixed()).await.expect("run");

        let sent = chain.sent();
        assert_eq!(sent.len(), 2);
        let clear = &sent[1];
        assert!(clear.data.is_empty());
        assert!(clear.authorizations[0].authorization.is_clear());
        assert!(chain.code_of(orch.owner()).is_empty());
        assert_eq!(
            orch.delegation_status().await.expect("status"),
            DelegationStatus::NotDelegated
        );
        assert_eq!(outcome.completed[1].kind, CallKind::ClearDelegation);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_signature_rejected_sends_nothing() {
        let config = sepolia();
        let wallet_addr = Address::repeat_byte(0xee);
        let mut wallet = MockAuthorizingWallet::new();
        wallet.expect_address().return_const(wallet_addr);
        wallet
            .expect_sign_authorization()
            .returning(|_, _| Err(RevokeError::SignatureRejected("user denied".into())));
        wallet.expect_sign_transaction_hash().never();

        let chain = Arc::new(FakeChain::new(wallet_addr));
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let orch = RevokeOrchestrator::new(
            &config,
            RevokeSettings::default(),
            chain.clone(),
            Arc::new(wallet),
            metrics.clone(),
        )
        .expect("orchestrator");

        let failure = orch.run(&mixed()).await.expect_err("rejected");
        assert!(matches!(failure.error, RevokeError::SignatureRejected(_)));
        assert!(failure.completed.is_empty());
        assert!(chain.sent().is_empty());
        assert!(matches!(orch.state(), RevokeState::Failed { .. }));
        assert!(metrics.render().contains("outcome=\"rejected\""));
    }

    #[tokio::test]
    async fn test_reverted_receipt_is_hard_failure() {
        let (chain, _, orch) = setup(RevokeSettings::default(), sepolia());
        chain.state.lock().expect("lock").revert = true;

        let failure = orch.run(&mixed()).await.expect_err("reverted");
        assert!(matches!(failure.error, RevokeError::TransactionReverted { .. }));
        assert!(failure.revoked_pairs().is_empty());
        assert_eq!(
            orch.state(),
            RevokeState::Failed {
                message: failure.error.user_message()
            }
        );
    }

    #[tokio::test]
    async fn test_already_delegated_uses_plain_transaction() {
        let config = sepolia();
        let (chain, _, orch) = setup(RevokeSettings::default(), config.clone());
        chain
            .state
            .lock()
            .expect("lock")
            .code
            .insert(orch.owner(), delegation_code(config.delegate.expect("delegate")));

        orch.run(&mixed()).await.expect("run");
        let sent = chain.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tx_type, EIP1559_TX_TYPE);
        assert!(sent[0].authorizations.is_empty());
    }

    #[tokio::test]
    async fn test_split_plan_authorizes_once() {
        let config = ChainConfig {
            delegate_supports_revoke_all: false,
            ..sepolia()
        };
        let (chain, _, orch) = setup(RevokeSettings::default(), config);
        let outcome = orch.run(&mixed()).await.expect("run");

        let sent = chain.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].tx_type, SET_CODE_TX_TYPE);
        assert_eq!(&sent[0].data[..4], &id(plan::REVOKE_ERC20_SIG));
        assert_eq!(sent[1].tx_type, EIP1559_TX_TYPE);
        assert_eq!(&sent[1].data[..4], &id(plan::REVOKE_FOR_ALL_SIG));
        let kinds: Vec<CallKind> = outcome.completed.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallKind::RevokeErc20, CallKind::RevokeForAll]);
    }

    #[tokio::test]
    async fn test_partial_completion_reported_on_failure() {
        let config = ChainConfig {
            delegate_supports_revoke_all: false,
            ..sepolia()
        };
        let (chain, _, orch) = setup(RevokeSettings::default(), config);
        chain.state.lock().expect("lock").fail_send_from = Some(1);

        let failure = orch.run(&mixed()).await.expect_err("second call fails");
        assert!(matches!(failure.error, RevokeError::Submission(_)));
        assert_eq!(failure.completed.len(), 1);
        assert_eq!(failure.revoked_pairs().len(), 3);
    }

    #[tokio::test]
    async fn test_clear_failure_is_only_a_warning() {
        let settings = RevokeSettings {
            clear_delegation: true,
            ..RevokeSettings::default()
        };
        let (chain, _, orch) = setup(settings, sepolia());
        chain.state.lock().expect("lock").fail_send_from = Some(1);

        let outcome = orch.run(&mixed()).await.expect("revocation succeeded");
        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(orch.state(), RevokeState::Done { revoked: 5 });
    }

    #[tokio::test]
    async fn test_clear_only_flow() {
        let (chain, _, orch) = setup(RevokeSettings::default(), sepolia());
        assert_eq!(orch.clear_delegation().await.expect("noop"), None);
        assert!(chain.sent().is_empty());

        orch.run(&mixed()).await.expect("run");
        let done = orch.clear_delegation().await.expect("clear").expect("call");
        assert_eq!(done.kind, CallKind::ClearDelegation);
        assert!(chain.code_of(orch.owner()).is_empty());
    }

    #[tokio::test]
    async fn test_nothing_to_revoke() {
        let (chain, _, orch) = setup(RevokeSettings::default(), sepolia());
        let mut inactive = candidate(1, 2, TokenStandard::Erc20);
        inactive.is_active = false;
        let failure = orch.run(&[inactive]).await.expect_err("empty");
        assert!(matches!(failure.error, RevokeError::NothingToRevoke));
        assert!(chain.sent().is_empty());
    }

    #[tokio::test]
    async fn test_eip7702_scheme_authorization() {
        let settings = RevokeSettings {
            authorization_scheme: AuthorizationScheme::Eip7702,
            ..RevokeSettings::default()
        };
        let wallet = Arc::new(LocalAuthorizingWallet::from_private_key(KEY).expect("wallet"));
        let chain = Arc::new(FakeChain {
            sender: wallet.address(),
            scheme: AuthorizationScheme::Eip7702,
            state: StdMutex::new(FakeState::default()),
        });
        let orch = RevokeOrchestrator::new(
            &sepolia(),
            settings,
            chain.clone(),
            wallet,
            Arc::new(Metrics::new().expect("metrics")),
        )
        .expect("orchestrator");
        orch.run(&mixed()).await.expect("run");
        assert_eq!(chain.code_of(orch.owner()).len(), 23);
    }

    #[test]
    fn test_no_delegate_configured() {
        let config = default_chains()
            .into_iter()
            .find(|c| c.key == "mainnet")
            .expect("mainnet");
        let chain = Arc::new(FakeChain::new(Address::zero()));
        let wallet = Arc::new(LocalAuthorizingWallet::from_private_key(KEY).expect("wallet"));
        let result = RevokeOrchestrator::new(
            &config,
            RevokeSettings::default(),
            chain,
            wallet,
            Arc::new(Metrics::new().expect("metrics")),
        );
        assert!(matches!(result, Err(RevokeError::NoDelegate(_))));
    }

    #[test]
    fn test_transition_table() {
        use RevokeState::*;
        let submitting = Submitting {
            kind: CallKind::RevokeAll,
            items: 1,
        };
        assert!(Idle.can_transition_to(&CheckingDelegation));
        assert!(CheckingDelegation.can_transition_to(&submitting));
        assert!(Confirming { tx_hash: H256::zero() }.can_transition_to(&CheckingDelegation));
        assert!(submitting.can_transition_to(&Failed { message: String::new() }));

        assert!(!Idle.can_transition_to(&submitting));
        assert!(!Done { revoked: 1 }.can_transition_to(&Failed { message: String::new() }));
        assert!(!Done { revoked: 1 }.can_transition_to(&CheckingDelegation));
        assert!(!Failed { message: String::new() }.can_transition_to(&Done { revoked: 0 }));
        assert!(Failed { message: String::new() }.can_transition_to(&Idle));
    }

    #[tokio::test]
    async fn test_watch_receiver_sees_terminal_state() {
        let (_, _, orch) = setup(RevokeSettings::default(), sepolia());
        let rx = orch.subscribe();
        assert_eq!(*rx.borrow(), RevokeState::Idle);
        orch.run(&mixed()).await.expect("run");
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(rx.borrow().status_message(), "Revoked 5 approval(s)");
    }
}
