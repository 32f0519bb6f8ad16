//! ERC-20 `transfer(address,uint256)` calldata encoding

use crate::error::{RelayerError, RelayerResult};
use crate::payment::Currency;

use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes, U256};
use lazy_static::lazy_static;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;

lazy_static! {
    static ref TRANSFER_SELECTOR: [u8; 4] = selector("transfer(address,uint256)");
}

fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Calldata plus the token contract it must be sent to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTransfer {
    pub contract: Address,
    pub destination: Address,
    pub amount: U256,
    pub calldata: Bytes,
}

/// Encodes token transfers for one network's token table
#[derive(Debug, Clone)]
pub struct TransferEncoder {
    network: String,
    tokens: HashMap<Currency, Address>,
}

impl TransferEncoder {
    pub fn new(network: impl Into<String>, tokens: HashMap<Currency, Address>) -> Self {
        Self {
            network: network.into(),
            tokens,
        }
    }

    /// Token contract for a currency, if the network supports it
    pub fn contract_for(&self, currency: &Currency) -> RelayerResult<Address> {
        self.tokens
            .get(currency)
            .copied()
            .ok_or_else(|| RelayerError::UnsupportedCurrency {
                currency: currency.to_string(),
                network: self.network.clone(),
            })
    }

    /// Build transfer calldata. Pure: no I/O, no shared state.
    pub fn encode(
        &self,
        destination: &str,
        amount: U256,
        currency: &Currency,
    ) -> RelayerResult<EncodedTransfer> {
        let contract = self.contract_for(currency)?;
        let destination = parse_destination(destination)?;

        if amount.is_zero() {
            return Err(RelayerError::InvalidAmount(
                "transfer amount must be positive".to_string(),
            ));
        }

        let mut calldata = TRANSFER_SELECTOR.to_vec();
        calldata.extend(abi::encode(&[
            Token::Address(destination),
            Token::Uint(amount),
        ]));

        Ok(EncodedTransfer {
            contract,
            destination,
            amount,
            calldata: Bytes::from(calldata),
        })
    }
}

fn parse_destination(raw: &str) -> RelayerResult<Address> {
    let trimmed = raw.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| RelayerError::InvalidAddress(format!("missing 0x prefix: {}", raw)))?;

    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(RelayerError::InvalidAddress(format!(
            "expected 20 hex bytes: {}",
            raw
        )));
    }

    let address: Address = trimmed
        .parse()
        .map_err(|_| RelayerError::InvalidAddress(raw.to_string()))?;

    // Tokens burn or revert on transfers to the zero address
    if address.is_zero() {
        return Err(RelayerError::InvalidAddress(
            "zero address is not a valid destination".to_string(),
        ));
    }

    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usdc() -> Address {
        "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".parse().unwrap()
    }

    fn encoder() -> TransferEncoder {
        let mut tokens = HashMap::new();
        tokens.insert(Currency::Usdc, usdc());
        TransferEncoder::new("base", tokens)
    }

    #[test]
    fn test_transfer_selector() {
        assert_eq!(*TRANSFER_SELECTOR, [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn test_encode_transfer_layout() {
        let dest = "0x000000000000000000000000000000000000000b";
        let encoded = encoder()
            .encode(dest, U256::from(1_000_000u64), &Currency::Usdc)
            .unwrap();

        assert_eq!(encoded.contract, usdc());
        assert_eq!(encoded.calldata.len(), 4 + 32 + 32);
        assert_eq!(&encoded.calldata[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        // address is left-padded into the first word
        assert_eq!(encoded.calldata[4 + 31], 0x0b);
        assert!(encoded.calldata[4..4 + 31].iter().all(|b| *b == 0));
        // amount 1_000_000 = 0x0f4240
        assert_eq!(&encoded.calldata[4 + 32 + 29..], &[0x0f, 0x42, 0x40]);
    }

    #[test]
    fn test_unsupported_currency() {
        let err = encoder()
            .encode(
                "0x000000000000000000000000000000000000000b",
                U256::from(1u64),
                &Currency::Other("DOGE".to_string()),
            )
            .unwrap_err();
        assert!(matches!(err, RelayerError::UnsupportedCurrency { .. }));

        let err = encoder()
            .encode(
                "0x000000000000000000000000000000000000000b",
                U256::from(1u64),
                &Currency::Usdt,
            )
            .unwrap_err();
        assert!(matches!(err, RelayerError::UnsupportedCurrency { .. }));
    }

    #[test]
    fn test_malformed_destination() {
        let enc = encoder();
        for bad in ["0x1234", "833589fCD6eDb6E08f4c7C32D4f71b54bdA02913", "0xzz3589fCD6eDb6E08f4c7C32D4f71b54bdA02913"] {
            let err = enc.encode(bad, U256::from(1u64), &Currency::Usdc).unwrap_err();
            assert!(matches!(err, RelayerError::InvalidAddress(_)), "{}", bad);
        }

        let err = enc
            .encode(
                "0x0000000000000000000000000000000000000000",
                U256::from(1u64),
                &Currency::Usdc,
            )
            .unwrap_err();
        assert!(matches!(err, RelayerError::InvalidAddress(_)));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let err = encoder()
            .encode(
                "0x000000000000000000000000000000000000000b",
                U256::zero(),
                &Currency::Usdc,
            )
            .unwrap_err();
        assert!(matches!(err, RelayerError::InvalidAmount(_)));
    }
}
