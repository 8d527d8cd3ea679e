//! Log and transaction decoding.
//!
//! The `try_*` functions report why something could not be decoded; the
//! plain variants are fail-open and hand back the raw item instead, which is
//! what the drain publishes.
//!
//! Decoded parameters are keyed twice, by position (`"0"`, `"1"`…) and by
//! name. Addresses are EIP-55 checksummed, integers are decimal strings and
//! byte strings are `0x` hex.

use alloy_core::dyn_abi::{DynSolType, DynSolValue};
use serde_json::{Map, Value};
use tracing::debug;

use chainstream_core::abi::{AbiParam, ContractAbi, ContractMember};
use chainstream_core::types::{Decoded, DecodedLog, DecodedTransaction, Log, Transaction};

use crate::error::AbiError;
use crate::signature::{canonical_type, event_topic, function_selector_hex};

// ─── Public API ───────────────────────────────────────────────────────────────

/// Decode `log` against `abi`, passing it through undecoded on any failure.
pub fn decode_log(log: &Log, abi: &ContractAbi) -> DecodedLog {
    match try_decode_log(log, abi) {
        Ok(decoded) => DecodedLog {
            log: log.clone(),
            decoded: Some(decoded),
        },
        Err(err) => {
            debug!(
                address = %log.address,
                transaction_hash = %log.transaction_hash,
                log_index = %log.log_index,
                error = %err,
                "log left undecoded"
            );
            DecodedLog::raw(log.clone())
        }
    }
}

/// Decode the call in `tx` against `abi`, passing it through on any failure.
pub fn decode_transaction(tx: &Transaction, abi: &ContractAbi, removed: bool) -> DecodedTransaction {
    match try_decode_transaction(tx, abi) {
        Ok(decoded) => DecodedTransaction {
            transaction: tx.clone(),
            removed,
            decoded: Some(decoded),
        },
        Err(err) => {
            debug!(transaction_hash = %tx.hash, error = %err, "transaction left undecoded");
            DecodedTransaction::raw(tx.clone(), removed)
        }
    }
}

/// Whether `tx` carries calldata to a contract at all.
pub fn is_contract_call(tx: &Transaction) -> bool {
    tx.to.is_some() && !strip_hex_prefix(&tx.input).is_empty()
}

pub fn try_decode_log(log: &Log, abi: &ContractAbi) -> Result<Decoded, AbiError> {
    let topic0 = log.topics.first().ok_or(AbiError::NoTopics)?;
    let event = abi
        .events()
        .find(|m| event_topic(m).eq_ignore_ascii_case(topic0))
        .ok_or_else(|| AbiError::NoMatchingEvent {
            topic: topic0.clone(),
        })?;

    let indexed_count = event.inputs.iter().filter(|p| p.is_indexed()).count();
    if log.topics.len() != indexed_count + 1 {
        return Err(AbiError::TopicCountMismatch {
            event: event.name.clone(),
            expected: indexed_count + 1,
            actual: log.topics.len(),
        });
    }

    // non-indexed parameters live in `data`, ABI-encoded as one tuple
    let body_params: Vec<&AbiParam> = event.inputs.iter().filter(|p| !p.is_indexed()).collect();
    let body_types = body_params
        .iter()
        .map(|p| resolve(p))
        .collect::<Result<Vec<_>, _>>()?;
    let mut body_values = decode_params(&body_types, &decode_hex(&log.data)?)?.into_iter();

    let mut topics = log.topics[1..].iter();
    let mut values = Vec::with_capacity(event.inputs.len());
    for param in &event.inputs {
        let value = if param.is_indexed() {
            let topic = topics.next().ok_or_else(|| AbiError::Decode("missing topic".into()))?;
            decode_topic(topic, param)?
        } else {
            let v = body_values
                .next()
                .ok_or_else(|| AbiError::Decode("missing data value".into()))?;
            to_json(v, param)
        };
        values.push(value);
    }

    Ok(Decoded {
        name: event.name.clone(),
        parameters: keyed(&event.inputs, values),
    })
}

pub fn try_decode_transaction(tx: &Transaction, abi: &ContractAbi) -> Result<Decoded, AbiError> {
    if !is_contract_call(tx) {
        return Err(AbiError::NotACall);
    }
    // node-supplied text: slice with `get` so a non-ASCII byte is an error
    let calldata = strip_hex_prefix(&tx.input);
    let (selector, args) = match (calldata.get(..8), calldata.get(8..)) {
        (Some(selector), Some(args)) => (format!("0x{}", selector.to_lowercase()), args),
        _ => return Err(AbiError::InvalidHex(format!("bad calldata: {}", tx.input))),
    };
    let function: &ContractMember = abi
        .functions()
        .find(|m| function_selector_hex(m) == selector)
        .ok_or_else(|| AbiError::NoMatchingFunction {
            selector: selector.clone(),
        })?;

    let types = function
        .inputs
        .iter()
        .map(resolve)
        .collect::<Result<Vec<_>, _>>()?;
    let args = decode_hex(args)?;
    let values = decode_params(&types, &args)?
        .into_iter()
        .zip(&function.inputs)
        .map(|(v, p)| to_json(v, p))
        .collect();

    Ok(Decoded {
        name: function.name.clone(),
        parameters: keyed(&function.inputs, values),
    })
}

// ─── Internals ────────────────────────────────────────────────────────────────

fn resolve(param: &AbiParam) -> Result<DynSolType, AbiError> {
    let canonical = canonical_type(param);
    DynSolType::parse(&canonical).map_err(|e| AbiError::UnsupportedType {
        ty: canonical,
        reason: e.to_string(),
    })
}

fn strip_hex_prefix(s: &str) -> &str {
    match s.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("0x") => &s[2..],
        _ => s,
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, AbiError> {
    hex::decode(strip_hex_prefix(s)).map_err(|e| AbiError::InvalidHex(format!("{e}: {s}")))
}

fn decode_params(types: &[DynSolType], data: &[u8]) -> Result<Vec<DynSolValue>, AbiError> {
    if types.is_empty() {
        return Ok(Vec::new());
    }
    let decoded = DynSolType::Tuple(types.to_vec())
        .abi_decode_params(data)
        .map_err(|e| AbiError::Decode(e.to_string()))?;
    match decoded {
        DynSolValue::Tuple(values) => Ok(values),
        other => Ok(vec![other]),
    }
}

/// Indexed reference types are stored as the hash of their encoding; the
/// topic is all that is left, so it is returned verbatim.
fn decode_topic(topic: &str, param: &AbiParam) -> Result<Value, AbiError> {
    let ty = resolve(param)?;
    if matches!(
        ty,
        DynSolType::String
            | DynSolType::Bytes
            | DynSolType::Array(_)
            | DynSolType::FixedArray(..)
            | DynSolType::Tuple(_)
    ) {
        return Ok(Value::String(topic.to_lowercase()));
    }
    let word = decode_hex(topic)?;
    if word.len() != 32 {
        return Err(AbiError::InvalidHex(format!("topic is not 32 bytes: {topic}")));
    }
    let value = ty
        .abi_decode(&word)
        .map_err(|e| AbiError::Decode(format!("topic {topic}: {e}")))?;
    Ok(to_json(value, param))
}

fn keyed(params: &[AbiParam], values: Vec<Value>) -> Map<String, Value> {
    let mut map = Map::new();
    for (i, (param, value)) in params.iter().zip(values).enumerate() {
        if !param.name.is_empty() {
            map.insert(param.name.clone(), value.clone());
        }
        map.insert(i.to_string(), value);
    }
    map
}

fn hex_string(bytes: &[u8]) -> Value {
    Value::String(format!("0x{}", hex::encode(bytes)))
}

/// JSON rendering of a decoded value. `param` supplies tuple component names.
fn to_json(value: DynSolValue, param: &AbiParam) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::Address(a) => Value::String(a.to_checksum(None)),
        DynSolValue::FixedBytes(word, size) => hex_string(&word[..size]),
        DynSolValue::Bytes(b) => hex_string(&b),
        DynSolValue::String(s) => Value::String(s),
        DynSolValue::Function(f) => hex_string(f.as_slice()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            Value::Array(items.into_iter().map(|v| to_json(v, param)).collect())
        }
        DynSolValue::Tuple(fields) => {
            let values: Vec<Value> = fields
                .into_iter()
                .zip(&param.components)
                .map(|(v, p)| to_json(v, p))
                .collect();
            Value::Object(keyed(&param.components, values))
        }
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}
