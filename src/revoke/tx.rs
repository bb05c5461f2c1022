//! Raw transaction encoding for self-executed revocations.
//!
//! Type 0x04 (EIP-7702) carries an authorization list; when the account is
//! already delegated an EIP-1559 (type 0x02) transaction is used instead,
//! since a set-code transaction with an empty authorization list is invalid.

use ethers::types::{Bytes, Signature, H256, U256};
use ethers::types::Address;
use ethers::utils::keccak256;
use ethers::utils::rlp::{Rlp, RlpStream};

use super::authorization::{normalize_v, SignedAuthorization};
use crate::config::RevokeSettings;
use crate::error::RevokeError;

pub const EIP1559_TX_TYPE: u8 = 0x02;
pub const SET_CODE_TX_TYPE: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEstimate {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTx {
    pub chain_id: u64,
    pub nonce: u64,
    pub fees: FeeEstimate,
    pub gas_limit: U256,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub authorizations: Vec<SignedAuthorization>,
}

impl UnsignedTx {
    pub fn tx_type(&self) -> u8 {
        if self.authorizations.is_empty() {
            EIP1559_TX_TYPE
        } else {
            SET_CODE_TX_TYPE
        }
    }

    fn field_count(&self) -> usize {
        if self.authorizations.is_empty() {
            9
        } else {
            10
        }
    }

    /// RLP list of the unsigned fields (without the type byte).
    pub fn rlp_payload(&self) -> Vec<u8> {
        let mut rlp = RlpStream::new_list(self.field_count());
        rlp.append(&U256::from(self.chain_id));
        rlp.append(&U256::from(self.nonce));
        rlp.append(&self.fees.max_priority_fee_per_gas);
        rlp.append(&self.fees.max_fee_per_gas);
        rlp.append(&self.gas_limit);
        rlp.append(&self.to);
        rlp.append(&self.value);
        rlp.append(&self.data.to_vec());
        rlp.begin_list(0); // access list
        if !self.authorizations.is_empty() {
            rlp.begin_list(self.authorizations.len());
            for auth in &self.authorizations {
                auth.rlp_append(&mut rlp);
            }
        }
        rlp.out().to_vec()
    }

    /// `keccak256(type || rlp(fields))`
    pub fn signing_hash(&self) -> H256 {
        let payload = self.rlp_payload();
        let mut msg = Vec::with_capacity(1 + payload.len());
        msg.push(self.tx_type());
        msg.extend_from_slice(&payload);
        H256(keccak256(msg))
    }

    /// `type || rlp(fields ++ [y_parity, r, s])`
    pub fn encode_signed(&self, sig: &Signature) -> Result<Bytes, RevokeError> {
        let payload = self.rlp_payload();
        let unsigned = Rlp::new(&payload);
        let count = unsigned
            .item_count()
            .map_err(|e| RevokeError::Signing(format!("rlp: {}", e)))?;

        let mut signed = RlpStream::new_list(count + 3);
        for i in 0..count {
            let item = unsigned
                .at(i)
                .map_err(|e| RevokeError::Signing(format!("rlp: {}", e)))?;
            signed.append_raw(item.as_raw(), 1);
        }
        signed.append(&normalize_v(sig.v));
        signed.append(&sig.r);
        signed.append(&sig.s);

        let body = signed.out();
        let mut raw = Vec::with_capacity(1 + body.len());
        raw.push(self.tx_type());
        raw.extend_from_slice(&body);
        Ok(Bytes::from(raw))
    }
}

/// Hash nodes report for a raw typed transaction.
pub fn raw_tx_hash(raw: &[u8]) -> H256 {
    H256(keccak256(raw))
}

pub fn gas_limit(settings: &RevokeSettings, items: usize, authorizations: usize) -> U256 {
    U256::from(settings.base_gas)
        + U256::from(settings.gas_per_item) * U256::from(items)
        + U256::from(settings.gas_per_authorization) * U256::from(authorizations)
}

// ─── Decoding (test fakes) ───────────────────────────────────────────────────

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct DecodedTx {
    pub tx_type: u8,
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Address,
    pub data: Vec<u8>,
    pub authorizations: Vec<SignedAuthorization>,
    pub signature: Signature,
}

#[cfg(test)]
pub fn decode_signed(raw: &[u8]) -> Result<DecodedTx, ethers::utils::rlp::DecoderError> {
    use super::authorization::Authorization;
    use ethers::utils::rlp::DecoderError;

    let (&tx_type, body) = raw.split_first().ok_or(DecoderError::RlpIsTooShort)?;
    let rlp = Rlp::new(body);
    let sig_at = if tx_type == SET_CODE_TX_TYPE { 10 } else { 9 };

    let mut authorizations = Vec::new();
    if tx_type == SET_CODE_TX_TYPE {
        for item in rlp.at(9)?.iter() {
            let chain_id: U256 = item.val_at(0)?;
            authorizations.push(SignedAuthorization {
                authorization: Authorization::new(chain_id.as_u64(), item.val_at(1)?, item.val_at(2)?),
                y_parity: item.val_at(3)?,
                r: item.val_at(4)?,
                s: item.val_at(5)?,
            });
        }
    }

    let chain_id: U256 = rlp.val_at(0)?;
    let nonce: U256 = rlp.val_at(1)?;
    let y_parity: u8 = rlp.val_at(sig_at)?;
    Ok(DecodedTx {
        tx_type,
        chain_id: chain_id.as_u64(),
        nonce: nonce.as_u64(),
        to: rlp.val_at(5)?,
        data: rlp.val_at(7)?,
        authorizations,
        signature: Signature {
            r: rlp.val_at(sig_at + 1)?,
            s: rlp.val_at(sig_at + 2)?,
            v: 27 + y_parity as u64,
        },
    })
}
