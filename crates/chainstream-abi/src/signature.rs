//! Canonical ABI signatures.
//!
//! The topic of a non-anonymous event is `keccak256("Name(type1,type2,...)")`
//! and a function selector is the first 4 bytes of the same hash over the
//! function's signature. Tuples are written as their parenthesised component
//! list, e.g. `swap((address,uint256)[],bytes)`.

use chainstream_core::abi::{AbiParam, ContractMember};
use tiny_keccak::{Hasher, Keccak};

/// Canonical form of one parameter type.
///
/// `tuple[2]` with components `(address, uint)` becomes `(address,uint256)[2]`;
/// the `uint`/`int` aliases are widened to 256 bits.
pub fn canonical_type(param: &AbiParam) -> String {
    let (base, suffix) = match param.ty.find('[') {
        Some(i) => param.ty.split_at(i),
        None => (param.ty.as_str(), ""),
    };
    let base = match base {
        "tuple" => {
            let inner: Vec<String> = param.components.iter().map(canonical_type).collect();
            format!("({})", inner.join(","))
        }
        "uint" => "uint256".to_string(),
        "int" => "int256".to_string(),
        other => other.to_string(),
    };
    format!("{base}{suffix}")
}

/// `Name(type1,type2,...)` over the member's inputs.
pub fn event_signature(member: &ContractMember) -> String {
    let types: Vec<String> = member.inputs.iter().map(canonical_type).collect();
    format!("{}({})", member.name, types.join(","))
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    output
}

/// `0x`-prefixed topic hash of an event.
pub fn event_topic(member: &ContractMember) -> String {
    format!("0x{}", hex::encode(keccak256(event_signature(member).as_bytes())))
}

/// 4-byte selector of a function.
pub fn function_selector(member: &ContractMember) -> [u8; 4] {
    let hash = keccak256(event_signature(member).as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// `0x`-prefixed selector, as it appears at the start of calldata.
pub fn function_selector_hex(member: &ContractMember) -> String {
    format!("0x{}", hex::encode(function_selector(member)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainstream_core::abi::ContractAbi;

    fn member(json: &str) -> ContractMember {
        ContractAbi::from_json(&format!("[{json}]")).unwrap().0.remove(0)
    }

    #[test]
    fn erc20_transfer_topic() {
        let ev = member(
            r#"{"type":"event","name":"Transfer","inputs":[
                {"name":"from","type":"address","indexed":true},
                {"name":"to","type":"address","indexed":true},
                {"name":"value","type":"uint256","indexed":false}]}"#,
        );
        assert_eq!(event_signature(&ev), "Transfer(address,address,uint256)");
        assert_eq!(
            event_topic(&ev),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn transfer_selector_uses_uint_alias() {
        let f = member(
            r#"{"type":"function","name":"transfer","inputs":[
                {"name":"to","type":"address"},{"name":"value","type":"uint"}]}"#,
        );
        assert_eq!(event_signature(&f), "transfer(address,uint256)");
        assert_eq!(function_selector(&f), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(function_selector_hex(&f), "0xa9059cbb");
    }

    #[test]
    fn tuples_are_flattened_recursively() {
        let p: AbiParam = serde_json::from_str(
            r#"{"name":"orders","type":"tuple[2][]","components":[
                {"name":"maker","type":"address"},
                {"name":"legs","type":"tuple[]","components":[
                    {"name":"amount","type":"uint"},{"name":"data","type":"bytes"}]}]}"#,
        )
        .unwrap();
        assert_eq!(canonical_type(&p), "(address,(uint256,bytes)[])[2][]");
    }
}
