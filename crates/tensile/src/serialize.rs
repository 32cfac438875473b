// Serialization — self-describing binary records for one tensor
//
// A record is laid out as:
//
//   ┌──────────────┬──────────────────────┬────────────────────────────┐
//   │ 8 bytes      │ N bytes              │ len * dtype size bytes     │
//   │ header size  │ JSON header (UTF-8)  │ buffer prefix, LE elements │
//   │ (u64 LE)     │                      │                            │
//   └──────────────┴──────────────────────┴────────────────────────────┘
//
// JSON header example:
//   {"dtype":"f32","shape":[3,2],"strides":[1,3],"order":[1,0],"offset":0,"len":6}
//
// The data section is the part of the view's buffer its layout can reach,
// stored as is. Decoding rebuilds the same shape, strides, axis order and
// offset over the same elements, so transposed or indexed views round-trip
// without being materialized. The dtype tag is checked against the type
// the caller asks for.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tensile_core::{CpuDevice, DType, Element, Error, Layout, Result, Shape, Tensor};

const HEADER_LEN_BYTES: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    dtype: String,
    shape: Vec<usize>,
    strides: Vec<usize>,
    order: Vec<usize>,
    offset: usize,
    len: usize,
}

fn json_err(e: serde_json::Error) -> Error {
    Error::Serialization(format!("header: {e}"))
}

fn io_err(e: std::io::Error) -> Error {
    Error::Serialization(format!("io: {e}"))
}

/// Encode a tensor into a record.
pub fn encode<T: Element>(tensor: &Tensor<T>) -> Result<Vec<u8>> {
    let (data, layout) = tensor.to_raw_parts()?;
    let header = Header {
        dtype: T::DTYPE.to_string(),
        shape: layout.dims().to_vec(),
        strides: layout.strides().to_vec(),
        order: layout.order().to_vec(),
        offset: layout.offset(),
        len: data.len(),
    };
    let json = serde_json::to_vec(&header).map_err(json_err)?;

    let mut out = Vec::with_capacity(HEADER_LEN_BYTES + json.len() + data.len() * T::DTYPE.size_in_bytes());
    out.extend_from_slice(&(json.len() as u64).to_le_bytes());
    out.extend_from_slice(&json);
    for v in data {
        v.write_le(&mut out);
    }
    Ok(out)
}

fn split_header(bytes: &[u8]) -> Result<(Header, &[u8])> {
    let len_bytes: [u8; HEADER_LEN_BYTES] = bytes
        .get(..HEADER_LEN_BYTES)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Serialization("record shorter than its length prefix".into()))?;
    let header_len = u64::from_le_bytes(len_bytes) as usize;
    let body = &bytes[HEADER_LEN_BYTES..];
    if header_len > body.len() {
        return Err(Error::Serialization(format!(
            "header length {header_len} exceeds record of {} bytes",
            bytes.len()
        )));
    }
    let (json, data) = body.split_at(header_len);
    let header: Header = serde_json::from_slice(json).map_err(json_err)?;
    Ok((header, data))
}

fn parse_dtype(tag: &str) -> Result<DType> {
    DType::from_tag(tag).ok_or_else(|| Error::Serialization(format!("unknown dtype tag {tag:?}")))
}

/// Element type stored in a record, without decoding the data.
pub fn peek_dtype(bytes: &[u8]) -> Result<DType> {
    let (header, _) = split_header(bytes)?;
    parse_dtype(&header.dtype)
}

/// Decode a record written by [`encode`] as a tensor of `T`.
pub fn decode<T: Element>(bytes: &[u8], device: &CpuDevice) -> Result<Tensor<T>> {
    let (header, data) = split_header(bytes)?;
    let dtype = parse_dtype(&header.dtype)?;
    if dtype != T::DTYPE {
        return Err(Error::DTypeMismatch {
            expected: T::DTYPE,
            got: dtype,
        });
    }
    let size = dtype.size_in_bytes();
    let expected = header
        .len
        .checked_mul(size)
        .ok_or_else(|| Error::Serialization(format!("element count {} overflows", header.len)))?;
    if data.len() != expected {
        return Err(Error::Serialization(format!(
            "expected {expected} data bytes for {} {dtype} elements, got {}",
            header.len,
            data.len()
        )));
    }
    let values = data
        .chunks_exact(size)
        .map(|c| T::read_le(c).ok_or_else(|| Error::Serialization("truncated element".into())))
        .collect::<Result<Vec<T>>>()?;
    let layout = Layout::new(Shape::new(header.shape), header.strides, header.order, header.offset)
        .map_err(|e| Error::Serialization(format!("layout: {e}")))?;
    tracing::trace!(shape = %layout.shape(), dtype = %dtype, "decoded tensor record");
    Tensor::from_raw_parts(values, layout, device)
}

/// Write a record to a file.
pub fn save<T: Element>(path: impl AsRef<Path>, tensor: &Tensor<T>) -> Result<()> {
    fs::write(path, encode(tensor)?).map_err(io_err)
}

/// Read a record from a file.
pub fn load<T: Element>(path: impl AsRef<Path>, device: &CpuDevice) -> Result<Tensor<T>> {
    let bytes = fs::read(path).map_err(io_err)?;
    decode(&bytes, device)
}
