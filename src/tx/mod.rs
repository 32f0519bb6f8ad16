//! Transaction construction: encoding, fees, nonces, signing and submission tracking

mod builder;
mod encoder;
mod gas;
mod nonce;
mod signer;
mod tracker;

pub use builder::{PreparedTransfer, TransactionBuilder, UnsignedTransaction};
pub use encoder::{EncodedTransfer, TransferEncoder};
pub use gas::{FeeEstimate, FeeEstimator, FeeParams};
pub use nonce::{NonceAllocator, NonceKey, NonceReservation, NonceSnapshot};
#[cfg(test)]
pub use signer::MockSigningGateway;
pub use signer::{
    CustodyApiSigner, LocalWalletSigner, SignedTransaction, SignerCredentials, SigningGateway,
};
pub use tracker::{
    SlotPoll, StatusChange, SubmissionRecord, SubmissionTracker, SubmitOutcome, TransferState,
};
