use alloy::primitives::{Address, Bytes, B256, U256};
use anyhow::{anyhow, Result};
use std::str::FromStr;

use crate::error::{BackendError, BindError};

fn strip_hex_prefix(value: &str) -> Option<&str> {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
}

/// Validates and normalizes an Ethereum address
pub fn validate_address(address: &str) -> Result<Address> {
    let address = address.trim();

    if address.is_empty() {
        return Err(anyhow!("Address cannot be empty"));
    }

    let Some(hex_part) = strip_hex_prefix(address) else {
        return Err(anyhow!(
            "Invalid address format: '{}'. Ethereum addresses must start with '0x'",
            address
        ));
    };

    if hex_part.len() != 40 {
        return Err(anyhow!(
            "Invalid address length: '{}'. Ethereum addresses must be exactly 42 characters (0x + 40 hex characters)",
            address
        ));
    }

    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!(
            "Invalid address format: '{}'. Contains non-hexadecimal characters",
            address
        ));
    }

    Address::from_str(address)
        .map_err(|e| anyhow!("Invalid Ethereum address: '{}'. Error: {}", address, e))
}

/// Parses a 32-byte hash (block hash, transaction hash).
pub fn parse_b256(value: &str) -> Result<B256> {
    let value = value.trim();
    let hex_part = strip_hex_prefix(value)
        .ok_or_else(|| anyhow!("Invalid hash: '{}'. Hashes must start with '0x'", value))?;

    if hex_part.len() != 64 {
        return Err(anyhow!(
            "Invalid hash length: '{}'. Expected 0x followed by 64 hex characters",
            value
        ));
    }

    B256::from_str(value).map_err(|e| anyhow!("Invalid hash '{}': {}", value, e))
}

/// Parses `0x`-prefixed hex into raw bytes (e.g. an RLP-encoded header).
pub fn parse_hex_bytes(value: &str) -> Result<Bytes> {
    let value = value.trim();
    let hex_part = strip_hex_prefix(value).unwrap_or(value);
    if hex_part.is_empty() {
        return Err(anyhow!("Hex payload cannot be empty"));
    }
    hex::decode(hex_part)
        .map(Bytes::from)
        .map_err(|e| anyhow!("Invalid hex payload: {}", e))
}

/// Parses an unsigned integer given in decimal or as `0x` hex.
pub fn parse_uint(value_str: &str) -> Result<U256> {
    let value_str = value_str.trim();
    if value_str.is_empty() {
        return Err(anyhow!("Value cannot be empty"));
    }

    match strip_hex_prefix(value_str) {
        Some(hex_part) => U256::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid hexadecimal value: '{}'", value_str)),
        None => U256::from_str(value_str).map_err(|_| {
            anyhow!(
                "Invalid numeric value: '{}'. Use decimal format or '0x' prefixed hex",
                value_str
            )
        }),
    }
}

/// Creates user-friendly error messages for common RPC errors
pub fn interpret_rpc_error(error: &str) -> String {
    if error.contains("execution reverted") {
        "Call reverted: the relay contract rejected the request. Check that the block is known and the header or dispute is valid.".to_string()
    } else if error.contains("insufficient funds") {
        "Transaction failed: Insufficient funds to cover gas costs. Make sure your account has enough ETH for gas fees.".to_string()
    } else if error.contains("gas required exceeds allowance") {
        "Transaction failed: Gas limit too low. Try increasing the gas limit for this transaction."
            .to_string()
    } else if error.contains("nonce too low") {
        "Transaction failed: Nonce too low. This usually means another transaction was already mined with this nonce.".to_string()
    } else if error.contains("replacement transaction underpriced") {
        "Transaction failed: Gas price too low to replace pending transaction. Increase the gas price.".to_string()
    } else if error.contains("connection refused") || error.contains("network unreachable") {
        "Network error: Cannot connect to RPC endpoint. Check your internet connection and RPC URL configuration.".to_string()
    } else if error.contains("timeout") {
        "Network error: Request timed out. The RPC endpoint may be overloaded or unreachable."
            .to_string()
    } else if error.contains("rate limit") {
        "Rate limit error: Too many requests to the RPC endpoint. Try again in a few moments or use a different endpoint.".to_string()
    } else if error.contains("method not found") || error.contains("notifications not supported") {
        "RPC error: The requested method is not supported by this RPC endpoint. Live events need a ws:// or wss:// endpoint.".to_string()
    } else {
        format!("RPC error: {}", error)
    }
}

/// Friendly text for a binding error, falling back to the RPC hints for
/// transport failures.
pub fn describe_bind_error(error: &BindError) -> String {
    match error {
        BindError::CallReverted { method, reason } => {
            format!("{} ({})", interpret_rpc_error(reason), method)
        }
        BindError::Call { source, .. }
        | BindError::Submission(source)
        | BindError::Filter(source)
        | BindError::Subscription(source) => match source {
            BackendError::Rpc(message) | BackendError::Reverted(message) => {
                interpret_rpc_error(message)
            }
            _ => error.to_string(),
        },
        other => other.to_string(),
    }
}
