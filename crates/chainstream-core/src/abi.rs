//! Contract ABI model and the durable ABI cache contract.
//!
//! The JSON shape is the Solidity compiler's ABI output, which is also what
//! Etherscan-compatible registries return.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Kind of an ABI entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    Function,
    Event,
    Constructor,
    Fallback,
    Receive,
    Error,
}

/// A function/event parameter, or a tuple component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<AbiParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_type: Option<String>,
}

impl AbiParam {
    pub fn is_indexed(&self) -> bool {
        self.indexed.unwrap_or(false)
    }

    /// `true` for `tuple`, `tuple[]`, `tuple[3][]`…
    pub fn is_tuple(&self) -> bool {
        self.ty.starts_with("tuple")
    }
}

/// One entry of a contract ABI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractMember {
    #[serde(rename = "type", default = "default_member_kind")]
    pub kind: MemberKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<AbiParam>,
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_mutability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payable: Option<bool>,
}

// The compiler omits `type` for functions in very old ABIs.
fn default_member_kind() -> MemberKind {
    MemberKind::Function
}

/// A full contract ABI.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractAbi(pub Vec<ContractMember>);

impl ContractAbi {
    /// Parse and validate ABI JSON text.
    pub fn from_json(text: &str) -> Result<Self, StreamError> {
        let abi: ContractAbi = serde_json::from_str(text)?;
        abi.validate()?;
        Ok(abi)
    }

    pub fn members(&self) -> &[ContractMember] {
        &self.0
    }

    /// Non-anonymous events, the only ones whose `topics[0]` identifies them.
    pub fn events(&self) -> impl Iterator<Item = &ContractMember> {
        self.0
            .iter()
            .filter(|m| m.kind == MemberKind::Event && !m.anonymous)
    }

    pub fn functions(&self) -> impl Iterator<Item = &ContractMember> {
        self.0
            .iter()
            .filter(|m| m.kind == MemberKind::Function && !m.anonymous)
    }

    /// Structural validation.
    ///
    /// Rejects rather than trims: one bad entry invalidates the whole ABI.
    pub fn validate(&self) -> Result<(), StreamError> {
        for (i, member) in self.0.iter().enumerate() {
            let named = matches!(
                member.kind,
                MemberKind::Function | MemberKind::Event | MemberKind::Error
            );
            if named && member.name.is_empty() {
                return Err(invalid(format!("entry {i}: {:?} without a name", member.kind)));
            }
            for param in member.inputs.iter().chain(member.outputs.iter()) {
                validate_param(param)
                    .map_err(|reason| invalid(format!("entry {i} ({}): {reason}", member.name)))?;
            }
            if member.kind != MemberKind::Event && member.inputs.iter().any(|p| p.indexed.is_some()) {
                return Err(invalid(format!(
                    "entry {i} ({}): `indexed` outside an event",
                    member.name
                )));
            }
        }
        Ok(())
    }
}

fn invalid(reason: String) -> StreamError {
    StreamError::Codec(format!("invalid ABI: {reason}"))
}

fn validate_param(param: &AbiParam) -> Result<(), String> {
    let base = strip_array_suffixes(&param.ty)?;
    if base == "tuple" {
        if param.components.is_empty() {
            return Err(format!("`{}` tuple without components", param.name));
        }
        return param.components.iter().try_for_each(validate_param);
    }
    if !param.components.is_empty() {
        return Err(format!("`{}` of type {} has components", param.name, param.ty));
    }
    if !is_elementary(base) {
        return Err(format!("`{}` has unknown type {}", param.name, param.ty));
    }
    Ok(())
}

/// `uint256[2][]` → `uint256`, checking every suffix is `[]` or `[N]`.
fn strip_array_suffixes(ty: &str) -> Result<&str, String> {
    let mut rest = ty;
    while let Some(open) = rest.rfind('[') {
        let dims = &rest[open + 1..];
        let Some(len) = dims.strip_suffix(']') else {
            return Err(format!("malformed array type {ty}"));
        };
        if !len.is_empty() && len.parse::<usize>().map_or(true, |n| n == 0) {
            return Err(format!("malformed array length in {ty}"));
        }
        rest = &rest[..open];
    }
    if rest.contains(']') {
        return Err(format!("malformed array type {ty}"));
    }
    Ok(rest)
}

fn is_elementary(ty: &str) -> bool {
    match ty {
        "address" | "bool" | "string" | "bytes" | "function" | "uint" | "int" => true,
        _ => {
            if let Some(n) = ty.strip_prefix("bytes") {
                return n.parse::<usize>().map_or(false, |n| (1..=32).contains(&n));
            }
            let bits = ty.strip_prefix("uint").or_else(|| ty.strip_prefix("int"));
            bits.and_then(|b| b.parse::<usize>().ok())
                .map_or(false, |n| n % 8 == 0 && (8..=256).contains(&n))
        }
    }
}

// ─── Durable cache ────────────────────────────────────────────────────────────

/// A durable ABI cache entry.
///
/// `abi = None` is a negative entry: the registry said the contract has no
/// ABI. Negative entries carry an expiry so the registry is asked again later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbiRecord {
    /// Lower-cased contract address.
    pub address: String,
    pub abi: Option<ContractAbi>,
    /// Milliseconds since epoch; `None` never expires.
    pub expires_at: Option<i64>,
}

impl AbiRecord {
    pub fn available(address: &str, abi: ContractAbi) -> Self {
        Self {
            address: address.to_lowercase(),
            abi: Some(abi),
            expires_at: None,
        }
    }

    pub fn unavailable(address: &str, ttl_ms: i64, now: i64) -> Self {
        Self {
            address: address.to_lowercase(),
            abi: None,
            expires_at: Some(now.saturating_add(ttl_ms)),
        }
    }

    pub fn is_available(&self) -> bool {
        self.abi.is_some()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Durable storage for ABIs keyed by lower-cased address.
#[async_trait]
pub trait AbiStore: Send + Sync {
    async fn get_abi(&self, address: &str) -> Result<Option<AbiRecord>, StreamError>;

    /// Upsert; available entries must be validated before they are written.
    async fn put_abi(&self, record: AbiRecord) -> Result<(), StreamError>;
}
