//! Signing through the custody service
//!
//! The relayer never holds production keys. `CustodyApiSigner` is the client of
//! the external custody API; `LocalWalletSigner` signs with an in-process key
//! for development networks and tests.

use super::builder::UnsignedTransaction;
use crate::error::{RelayerError, RelayerResult};
use crate::payment::Account;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::{keccak256, rlp::Rlp};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};

/// What the custody service needs to authorize a signature
#[derive(Debug, Clone)]
pub struct SignerCredentials {
    pub sub_organization_id: String,
    pub wallet_address: Address,
    pub authentication_proof: String,
}

impl SignerCredentials {
    pub fn for_account(account: &Account, authentication_proof: impl Into<String>) -> Self {
        Self {
            sub_organization_id: account.sub_organization_id.clone(),
            wallet_address: account.wallet_address,
            authentication_proof: authentication_proof.into(),
        }
    }
}

/// A signed transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    raw: Bytes,
    hash: H256,
    unsigned: UnsignedTransaction,
}

impl SignedTransaction {
    /// Accept a signed payload only if it is `unsigned`, signed by its sender
    pub fn from_raw(unsigned: UnsignedTransaction, raw: Bytes) -> RelayerResult<Self> {
        let rlp = Rlp::new(raw.as_ref());
        let (decoded, signature) = TypedTransaction::decode_signed(&rlp).map_err(|e| {
            RelayerError::SigningRejected(format!("signed payload does not decode: {}", e))
        })?;

        let sighash = unsigned.sighash();
        if decoded.sighash() != sighash {
            return Err(RelayerError::SigningRejected(
                "signer returned a different transaction than requested".to_string(),
            ));
        }

        let signer = signature
            .recover(sighash)
            .map_err(|e| RelayerError::SigningRejected(format!("unrecoverable signature: {}", e)))?;
        if signer != unsigned.from {
            return Err(RelayerError::SigningRejected(format!(
                "signed by {:?}, expected {:?}",
                signer, unsigned.from
            )));
        }

        Ok(Self {
            hash: H256::from(keccak256(&raw)),
            raw,
            unsigned,
        })
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Transaction hash, known before broadcast
    pub fn hash(&self) -> H256 {
        self.hash
    }

    pub fn unsigned(&self) -> &UnsignedTransaction {
        &self.unsigned
    }

    pub fn nonce(&self) -> u64 {
        self.unsigned.nonce
    }
}

/// Signing capability. One call per unsigned transaction.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SigningGateway: Send + Sync {
    async fn sign(
        &self,
        unsigned: &UnsignedTransaction,
        credentials: &SignerCredentials,
    ) -> RelayerResult<SignedTransaction>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest<'a> {
    organization_id: &'a str,
    sign_with: String,
    /// Hex RLP of the unsigned transaction
    unsigned_transaction: String,
    /// Idempotency key; the custody service signs a given digest once
    request_id: String,
    authentication_proof: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignResponse {
    signed_transaction: String,
}

/// HTTP client of the external custody service
pub struct CustodyApiSigner {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl CustodyApiSigner {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>, timeout: Duration) -> RelayerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayerError::Config(format!("Failed to build custody client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
        })
    }
}

#[async_trait]
impl SigningGateway for CustodyApiSigner {
    async fn sign(
        &self,
        unsigned: &UnsignedTransaction,
        credentials: &SignerCredentials,
    ) -> RelayerResult<SignedTransaction> {
        let request_id = format!("{:?}", unsigned.sighash());
        let body = SignRequest {
            organization_id: &credentials.sub_organization_id,
            sign_with: format!("{:?}", credentials.wallet_address),
            unsigned_transaction: hex::encode(unsigned.encoded()),
            request_id: request_id.clone(),
            authentication_proof: &credentials.authentication_proof,
        };

        debug!(
            "Requesting signature {} from custody for {:?}",
            request_id, credentials.wallet_address
        );

        let response = self
            .client
            .post(format!("{}/v1/sign_transaction", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayerError::SigningUnavailable(e.to_string()))?;

        let status = response.status();
        if let Some(err) = status_error(status) {
            match &err {
                RelayerError::SigningUnavailable(_) => {
                    warn!("Custody service unavailable for {}: {}", request_id, status)
                }
                _ => error!("Custody service refused to sign {}: {}", request_id, status),
            }
            return Err(err);
        }

        let payload: SignResponse = response
            .json()
            .await
            .map_err(|e| RelayerError::SigningUnavailable(format!("malformed response: {}", e)))?;
        let raw = hex::decode(payload.signed_transaction.trim_start_matches("0x"))
            .map_err(|e| RelayerError::SigningRejected(format!("signed payload is not hex: {}", e)))?;

        SignedTransaction::from_raw(unsigned.clone(), Bytes::from(raw))
    }
}

/// Map a custody response status to the error it stands for
fn status_error(status: reqwest::StatusCode) -> Option<RelayerError> {
    if status.is_success() {
        return None;
    }
    let message = format!("custody service returned {}", status);
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Some(RelayerError::SigningUnavailable(message))
    } else {
        Some(RelayerError::SigningRejected(message))
    }
}

/// Signs with a key held in process
pub struct LocalWalletSigner {
    wallet: LocalWallet,
}

impl LocalWalletSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Load a hex private key
    pub fn from_private_key(key: &str) -> RelayerResult<Self> {
        let wallet: LocalWallet = key
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| RelayerError::Config(format!("Invalid private key: {}", e)))?;
        Ok(Self { wallet })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }
}

#[async_trait]
impl SigningGateway for LocalWalletSigner {
    async fn sign(
        &self,
        unsigned: &UnsignedTransaction,
        credentials: &SignerCredentials,
    ) -> RelayerResult<SignedTransaction> {
        if credentials.wallet_address != self.wallet.address() {
            return Err(RelayerError::SigningRejected(format!(
                "no key for {:?}",
                credentials.wallet_address
            )));
        }

        let typed = unsigned.to_typed();
        let signature = self
            .wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| RelayerError::SigningRejected(e.to_string()))?;

        SignedTransaction::from_raw(unsigned.clone(), typed.rlp_signed(&signature))
    }
}
