//! Typed wrappers for the guest's wallet exports.
//!
//! Each wrapper flattens its arguments, calls the export through
//! [`Bridge::call`] and shapes the result. Exports that return a host value
//! hand back a JSON array of strings; anything else is an
//! [`BridgeError::Unexpected`].

use keystone_hostapi::HostValue;
use serde::Deserialize;

use crate::error::BridgeError;
use crate::runtime::{Arg, Bridge, ReturnKind};

/// Parameters for deriving one address from a mnemonic.
#[derive(Debug, Clone, Deserialize)]
pub struct AddressRequest {
    pub mnemonic: String,
    pub coin_type: u32,
    pub account_index: u32,
    pub internal: bool,
    pub address_index: u32,
    pub bech32_hrp: String,
}

impl AddressRequest {
    fn args(&self) -> [Arg<'_>; 6] {
        [
            Arg::Str(&self.mnemonic),
            Arg::U32(self.coin_type),
            Arg::U32(self.account_index),
            Arg::Bool(self.internal),
            Arg::U32(self.address_index),
            Arg::Str(&self.bech32_hrp),
        ]
    }
}

/// Interpret a host value as a JSON array of strings.
fn string_list(value: HostValue) -> Result<Vec<String>, BridgeError> {
    let unexpected = |v: &HostValue| BridgeError::Unexpected(format!("expected an array of strings, got {}", v.kind()));
    let HostValue::Json(serde_json::Value::Array(items)) = &value else {
        return Err(unexpected(&value));
    };
    items
        .iter()
        .map(|item| item.as_str().map(str::to_owned).ok_or_else(|| unexpected(&value)))
        .collect()
}

impl Bridge {
    /// Generate a fresh BIP-39 mnemonic from the guest's random source.
    pub fn generate_mnemonic(&mut self) -> Result<String, BridgeError> {
        self.call("generate_mnemonic", &[], ReturnKind::String)?
            .into_string()
    }

    /// Derive an address; returns `[hex, bech32]`.
    pub fn generate_address(&mut self, request: &AddressRequest) -> Result<Vec<String>, BridgeError> {
        let value = self
            .call("generate_address", &request.args(), ReturnKind::Value)?
            .into_value()?;
        string_list(value)
    }

    /// Derive an address, also returning the guest's derivation log lines.
    pub fn generate_address_with_logs(&mut self, request: &AddressRequest) -> Result<Vec<String>, BridgeError> {
        let value = self
            .call("generate_address_with_logs", &request.args(), ReturnKind::Value)?
            .into_value()?;
        string_list(value)
    }

    /// Re-encode a bech32 address under a new human-readable part; returns
    /// `[address_json, bech32]`.
    pub fn change_bech32_hrp(&mut self, address: &str, hrp: &str) -> Result<Vec<String>, BridgeError> {
        let value = self
            .call(
                "change_bech32_hrp",
                &[Arg::Str(address), Arg::Str(hrp)],
                ReturnKind::Value,
            )?
            .into_value()?;
        string_list(value)
    }

    /// Encode a hex address of the given kind as bech32.
    pub fn to_bech32_address(&mut self, address: &str, hrp: &str, address_type: u8) -> Result<String, BridgeError> {
        self.call(
            "to_bech32_address",
            &[Arg::Str(address), Arg::Str(hrp), Arg::U32(address_type as u32)],
            ReturnKind::String,
        )?
        .into_string()
    }
}
