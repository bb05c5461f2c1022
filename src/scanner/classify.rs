//! ERC721 vs ERC1155 for operator approvals, via `supportsInterface(0xd9b67a26)`.
//! Anything that does not answer `true` stays ERC721.

use ethers::types::Address;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

use super::reads::{read_chunked, ContractReader, ReadCall};
use super::types::{ApprovalDeclaration, ScanWarning, TokenStandard};

pub const ERC1155_INTERFACE_ID: [u8; 4] = [0xd9, 0xb6, 0x7a, 0x26];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifyOutcome {
    pub erc1155: HashSet<Address>,
    pub probed: usize,
    pub failed: usize,
}

impl ClassifyOutcome {
    pub fn warning(&self) -> Option<ScanWarning> {
        (self.failed > 0).then(|| ScanWarning::ClassificationFailures {
            failed: self.failed,
            total: self.probed,
        })
    }

    /// Retag every operator approval on a collection that reported ERC1155.
    pub fn apply(&self, declarations: &mut [ApprovalDeclaration]) {
        for decl in declarations.iter_mut() {
            if decl.standard.is_nft() && self.erc1155.contains(&decl.token) {
                decl.standard = TokenStandard::Erc1155;
            }
        }
    }
}

pub async fn classify_collections(
    reader: &dyn ContractReader,
    chain: &str,
    declarations: &[ApprovalDeclaration],
    chunk_size: usize,
) -> ClassifyOutcome {
    let collections: Vec<Address> = declarations
        .iter()
        .filter(|d| d.standard.is_nft())
        .map(|d| d.token)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    if collections.is_empty() {
        return ClassifyOutcome::default();
    }

    let calls: Vec<ReadCall> = collections
        .iter()
        .map(|&token| ReadCall::SupportsInterface {
            token,
            interface_id: ERC1155_INTERFACE_ID,
        })
        .collect();
    let reads = read_chunked(reader, chain, &calls, chunk_size).await;

    let mut outcome = ClassifyOutcome {
        probed: collections.len(),
        ..Default::default()
    };
    for (token, value) in collections.iter().zip(reads.values.iter()) {
        match value.as_ref().and_then(|v| v.as_bool()) {
            Some(true) => {
                outcome.erc1155.insert(*token);
            }
            Some(false) => {}
            None => outcome.failed += 1,
        }
    }

    if outcome.failed > 0 {
        warn!(
            "[CLASSIFY] {} {}/{} probes failed; assuming ERC721",
            chain, outcome.failed, outcome.probed
        );
    }
    debug!(
        "[CLASSIFY] {} {} collections, {} ERC1155",
        chain,
        outcome.probed,
        outcome.erc1155.len()
    );
    outcome
}
