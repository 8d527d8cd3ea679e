//! Block payload codec: JSON, then zlib.

use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

use crate::error::StreamError;
use crate::types::BlockPayload;

/// Serialise and deflate a `{block, receipts}` payload.
pub fn encode_payload(payload: &BlockPayload) -> Result<Vec<u8>, StreamError> {
    let json = serde_json::to_vec(payload)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| StreamError::Codec(format!("deflate: {e}")))?;
    encoder
        .finish()
        .map_err(|e| StreamError::Codec(format!("deflate: {e}")))
}

/// Inflate and parse a payload produced by [`encode_payload`].
pub fn decode_payload(bytes: &[u8]) -> Result<BlockPayload, StreamError> {
    let mut json = Vec::new();
    ZlibDecoder::new(bytes)
        .read_to_end(&mut json)
        .map_err(|e| StreamError::Codec(format!("inflate: {e}")))?;
    Ok(serde_json::from_slice(&json)?)
}
