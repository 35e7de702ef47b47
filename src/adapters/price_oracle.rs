//! HTTP price oracle for the base token
//!
//! Looks the base token up on a token-prices-by-address endpoint.

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::Address;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ports::{OracleError, PriceOracle};

pub const DEFAULT_PRICE_API_URL: &str = "https://api.g.alchemy.com/prices/v1";
pub const DEFAULT_NETWORK: &str = "base-mainnet";

#[derive(Debug, Clone)]
pub struct HttpPriceOracle {
    http: Client,
    api_url: String,
    api_key: String,
    network: String,
    base_token: Address,
}

impl HttpPriceOracle {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        network: impl Into<String>,
        base_token: Address,
    ) -> Result<Self, OracleError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| OracleError::Request(e.to_string()))?;

        Ok(Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
            network: network.into(),
            base_token,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}/tokens/by-address",
            self.api_url.trim_end_matches('/'),
            self.api_key
        )
    }
}

#[async_trait::async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn base_price(&self) -> Result<Decimal, OracleError> {
        let request = PriceRequest {
            addresses: vec![AddressQuery {
                network: self.network.clone(),
                address: self.base_token.to_string(),
            }],
        };

        let response = self
            .http
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .map_err(|e| OracleError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OracleError::Request(format!("HTTP {}", response.status())));
        }

        let body: PriceResponse = response
            .json()
            .await
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;

        first_price(&body, &self.base_token)
    }
}

fn first_price(body: &PriceResponse, token: &Address) -> Result<Decimal, OracleError> {
    let entry = body
        .data
        .first()
        .ok_or_else(|| OracleError::NoPrice(token.to_string()))?;

    if let Some(error) = &entry.error {
        return Err(OracleError::InvalidResponse(error.clone()));
    }

    let value = entry
        .prices
        .first()
        .map(|p| p.value.as_str())
        .ok_or_else(|| OracleError::NoPrice(token.to_string()))?;

    Decimal::from_str(value).map_err(|e| OracleError::InvalidResponse(format!("{}: {}", value, e)))
}

#[derive(Debug, Serialize)]
struct PriceRequest {
    addresses: Vec<AddressQuery>,
}

#[derive(Debug, Serialize)]
struct AddressQuery {
    network: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    #[serde(default)]
    data: Vec<TokenPrices>,
}

#[derive(Debug, Deserialize)]
struct TokenPrices {
    #[serde(default)]
    prices: Vec<PricePoint>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PricePoint {
    value: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_price_response() {
        let json = r#"{
            "data": [{
                "network": "base-mainnet",
                "address": "0x0b3e328455c4059eeb9e3f84b5543f74e24e7e1b",
                "prices": [{"currency": "usd", "value": "1.2345", "lastUpdatedAt": "2026-01-01T00:00:00Z"}]
            }]
        }"#;
        let body: PriceResponse = serde_json::from_str(json).unwrap();
        assert_eq!(first_price(&body, &Address::ZERO).unwrap(), dec!(1.2345));
    }

    #[test]
    fn test_empty_response_has_no_price() {
        let body: PriceResponse = serde_json::from_str(r#"{"data": []}"#).unwrap();
        assert!(matches!(first_price(&body, &Address::ZERO), Err(OracleError::NoPrice(_))));

        let body: PriceResponse =
            serde_json::from_str(r#"{"data": [{"prices": [], "error": "Token not found"}]}"#).unwrap();
        assert!(matches!(
            first_price(&body, &Address::ZERO),
            Err(OracleError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_endpoint_format() {
        let oracle = HttpPriceOracle::new("https://prices.example/v1/", "key123", DEFAULT_NETWORK, Address::ZERO)
            .unwrap();
        assert_eq!(oracle.endpoint(), "https://prices.example/v1/key123/tokens/by-address");
    }
}
