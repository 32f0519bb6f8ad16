//! Payment-side data model: intents, accounts and the status fed back to
//! the payment record.

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Token a payment is denominated in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Currency {
    Usdc,
    Usdt,
    /// Any other code; only usable if a network configures a contract for it
    Other(String),
}

impl Currency {
    pub fn code(&self) -> &str {
        match self {
            Currency::Usdc => "USDC",
            Currency::Usdt => "USDT",
            Currency::Other(code) => code,
        }
    }
}

impl FromStr for Currency {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        Ok(match code.as_str() {
            "USDC" => Currency::Usdc,
            "USDT" => Currency::Usdt,
            _ => Currency::Other(code),
        })
    }
}

impl From<String> for Currency {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(currency) => currency,
            Err(never) => match never {},
        }
    }
}

impl From<Currency> for String {
    fn from(c: Currency) -> Self {
        c.code().to_string()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A custodial wallet owned by a workspace. Many payments share one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub wallet_address: Address,
    /// Custody-side organization the wallet lives under
    pub sub_organization_id: String,
}

/// Internal request to move `amount` of `currency` from `source` to `destination`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub source: Account,
    /// Raw destination as received from the payment layer; validated by the encoder
    pub destination: String,
    /// Smallest token unit
    pub amount: U256,
    pub currency: Currency,
    pub network: String,
}

impl PaymentIntent {
    pub fn new(
        source: Account,
        destination: impl Into<String>,
        amount: impl Into<U256>,
        currency: Currency,
        network: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            destination: destination.into(),
            amount: amount.into(),
            currency,
            network: network.into(),
        }
    }
}

/// Payment-record status as seen by the payment layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Initiated,
    Processing,
    Submitted,
    Stuck,
    Confirmed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "initiated",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Submitted => "submitted",
            PaymentStatus::Stuck => "stuck",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(PaymentStatus::Initiated),
            "processing" => Some(PaymentStatus::Processing),
            "submitted" => Some(PaymentStatus::Submitted),
            "stuck" => Some(PaymentStatus::Stuck),
            "confirmed" => Some(PaymentStatus::Confirmed),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_codes_are_case_insensitive() {
        assert_eq!("usdc".parse::<Currency>().unwrap(), Currency::Usdc);
        assert_eq!(" USDT ".parse::<Currency>().unwrap(), Currency::Usdt);
        assert_eq!(
            "doge".parse::<Currency>().unwrap(),
            Currency::Other("DOGE".to_string())
        );
    }

    #[test]
    fn test_currency_serializes_as_code() {
        let json = serde_json::to_string(&Currency::Usdc).unwrap();
        assert_eq!(json, "\"USDC\"");
        let back: Currency = serde_json::from_str("\"eurc\"").unwrap();
        assert_eq!(back, Currency::Other("EURC".to_string()));
    }
}
