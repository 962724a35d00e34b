//! Per-cell tile decompression.
//!
//! Every compressed cell starts with a small header: the payload length,
//! one byte-ordering marker, and the ordered list of transform ids that
//! were applied during compression. Decompression undoes the chain in
//! reverse: the entropy stage first, then the integer preconditioning
//! reversal, with the raw stage terminating a chain by reinterpreting
//! whatever bytes remain as the declared element type.

use crate::column::{ColumnData, ColumnDescriptor, ElementType};
use crate::error::{Error, Result};
use crate::huffman;
use crate::stream::{buf_i16_native_to_le, ByteStream};

/// The closed set of reversible cell transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Id 0: the payload is the typed array verbatim.
    Raw,
    /// Id 1: second-order integer smoothing applied before compression.
    Preconditioning,
    /// Id 2: canonical-Huffman entropy coding of 16-bit symbols.
    Huffman,
}

impl Transform {
    /// Resolve a header transform id, rejecting unknown ids explicitly.
    pub fn from_id(id: u16) -> Result<Self> {
        match id {
            0 => Ok(Transform::Raw),
            1 => Ok(Transform::Preconditioning),
            2 => Ok(Transform::Huffman),
            other => Err(Error::UnsupportedTransform(other)),
        }
    }

    /// The wire id of this transform.
    pub fn id(&self) -> u16 {
        match self {
            Transform::Raw => 0,
            Transform::Preconditioning => 1,
            Transform::Huffman => 2,
        }
    }
}

/// The compression header at the front of every compressed cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Declared payload length in bytes.
    pub payload_len: i64,
    /// Byte-ordering marker carried by the format.
    pub ordering: u8,
    /// Transforms in the order they were applied during compression.
    pub transforms: Vec<Transform>,
}

impl BlockHeader {
    /// Parse the header: `i64` payload length, one ordering byte, a `u8`
    /// transform count, then that many `u16` transform ids.
    pub fn read(stream: &mut ByteStream<'_>) -> Result<Self> {
        let payload_len = stream.read_i64_le()?;
        if payload_len < 0 {
            return Err(Error::InvalidValue);
        }
        let ordering = stream.read_u8()?;
        let count = stream.read_u8()?;
        let mut transforms = Vec::with_capacity(count as usize);
        for _ in 0..count {
            transforms.push(Transform::from_id(stream.read_u16_le()?)?);
        }
        Ok(BlockHeader {
            payload_len,
            ordering,
            transforms,
        })
    }
}

/// Reverse the second-order smoothing transform in place.
///
/// Strictly left to right: each element past the second is rebuilt from the
/// two already-reverted predecessors as `d[i] += (d[i-1] + d[i-2]) / 2`,
/// with the division truncating toward zero exactly like the encoder's
/// integer arithmetic.
pub fn revert_preconditioning(data: &mut [i16]) {
    for i in 2..data.len() {
        let half = ((data[i - 1] as i32 + data[i - 2] as i32) / 2) as i16;
        data[i] = data[i].wrapping_add(half);
    }
}

/// Decompress one cell into a typed array.
///
/// The transform list is applied in reverse order of appearance. A `Raw`
/// stage terminates the chain by interpreting the remaining bytes as the
/// declared element type; a chain that ends after the entropy stage yields
/// the signed 16-bit alphabet, which is reinterpreted only when the
/// declared type has a different width (the raw sample column is declared
/// as unsigned byte but carries 16-bit samples, so it stays 16-bit).
pub fn decode_cell(cell: &[u8], column: &ColumnDescriptor) -> Result<ColumnData> {
    let mut stream = ByteStream::new(cell);
    let header = BlockHeader::read(&mut stream)?;

    let mut decoded: Option<Vec<i16>> = None;
    for transform in header.transforms.iter().rev() {
        match transform {
            Transform::Raw => {
                return ColumnData::from_le_bytes(stream.rest(), column.element_type);
            }
            Transform::Huffman => {
                decoded = Some(huffman::decode_block(&mut stream)?);
            }
            Transform::Preconditioning => {
                let mut buf = match decoded.take() {
                    Some(buf) => buf,
                    // Preconditioning without a preceding entropy stage
                    // operates directly on the 16-bit payload.
                    None => match ColumnData::from_le_bytes(stream.rest(), ElementType::Short)? {
                        ColumnData::Short(buf) => buf,
                        _ => return Err(Error::InvalidValue),
                    },
                };
                revert_preconditioning(&mut buf);
                decoded = Some(buf);
            }
        }
    }

    match decoded {
        Some(shorts) => reinterpret_shorts(shorts, column.element_type),
        // An empty transform list leaves the payload untouched.
        None => ColumnData::from_le_bytes(stream.rest(), column.element_type),
    }
}

/// Give a decoded 16-bit buffer the declared element type.
fn reinterpret_shorts(shorts: Vec<i16>, element_type: ElementType) -> Result<ColumnData> {
    match element_type {
        ElementType::Short => Ok(ColumnData::Short(shorts)),
        // The entropy alphabet is signed 16-bit; a byte-declared sample
        // column keeps the decoded width.
        ElementType::Byte => Ok(ColumnData::Short(shorts)),
        _ => {
            let mut bytes: Vec<u8> = bytemuck::pod_collect_to_vec(&shorts);
            buf_i16_native_to_le(&mut bytes);
            ColumnData::from_le_bytes(&bytes, element_type)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, repeat: usize, element_type: ElementType) -> ColumnDescriptor {
        ColumnDescriptor {
            name: String::from(name),
            repeat,
            element_type,
        }
    }

    /// Assemble a cell: header bytes followed by the payload.
    fn make_cell(transforms: &[Transform], payload: &[u8]) -> Vec<u8> {
        let mut cell = Vec::new();
        cell.extend_from_slice(&(payload.len() as i64).to_le_bytes());
        cell.push(b'<');
        cell.push(transforms.len() as u8);
        for t in transforms {
            cell.extend_from_slice(&t.id().to_le_bytes());
        }
        cell.extend_from_slice(payload);
        cell
    }

    // --- header parsing ---

    #[test]
    fn header_roundtrip() {
        let cell = make_cell(&[Transform::Preconditioning, Transform::Huffman], &[]);
        let mut s = ByteStream::new(&cell);
        let header = BlockHeader::read(&mut s).unwrap();
        assert_eq!(header.payload_len, 0);
        assert_eq!(header.ordering, b'<');
        assert_eq!(
            header.transforms,
            vec![Transform::Preconditioning, Transform::Huffman]
        );
    }

    #[test]
    fn header_unknown_transform() {
        let mut cell = Vec::new();
        cell.extend_from_slice(&0i64.to_le_bytes());
        cell.push(b'<');
        cell.push(1);
        cell.extend_from_slice(&99u16.to_le_bytes());
        let mut s = ByteStream::new(&cell);
        assert!(matches!(
            BlockHeader::read(&mut s),
            Err(Error::UnsupportedTransform(99))
        ));
    }

    #[test]
    fn header_negative_length() {
        let mut cell = Vec::new();
        cell.extend_from_slice(&(-1i64).to_le_bytes());
        cell.push(b'<');
        cell.push(0);
        let mut s = ByteStream::new(&cell);
        assert!(matches!(BlockHeader::read(&mut s), Err(Error::InvalidValue)));
    }

    #[test]
    fn header_truncated() {
        let cell = make_cell(&[Transform::Raw], &[]);
        let mut s = ByteStream::new(&cell[..9]);
        assert!(matches!(BlockHeader::read(&mut s), Err(Error::Truncated)));
    }

    // --- preconditioning ---

    #[test]
    fn revert_short_buffers_unchanged() {
        let mut empty: [i16; 0] = [];
        revert_preconditioning(&mut empty);

        let mut one = [42i16];
        revert_preconditioning(&mut one);
        assert_eq!(one, [42]);

        let mut two = [3i16, -4];
        revert_preconditioning(&mut two);
        assert_eq!(two, [3, -4]);
    }

    #[test]
    fn revert_known_vector() {
        // Forward transform of [2, 4, 7, 11]: d[2] -= (4+2)/2, d[3] -= (7+4)/2
        let mut data = [2i16, 4, 4, 6];
        revert_preconditioning(&mut data);
        assert_eq!(data, [2, 4, 7, 11]);
    }

    #[test]
    fn revert_truncates_toward_zero_for_negative_sums() {
        // (-3 + 0) / 2 truncates to -1, not -2.
        let mut data = [0i16, -3, 10];
        revert_preconditioning(&mut data);
        assert_eq!(data, [0, -3, 9]);

        // (-5 + -4) / 2 = -4 (toward zero), applied left to right.
        let mut data = [-5i16, -4, 0, 0];
        revert_preconditioning(&mut data);
        assert_eq!(data[2], -4);
        // d[3] += (d[2] + d[1]) / 2 = (-4 + -4) / 2 = -4
        assert_eq!(data[3], -4);
    }

    #[test]
    fn revert_then_apply_is_identity() {
        let original: Vec<i16> = vec![100, -200, 3000, -42, 7, 7, -30000, 12345];

        // Forward pass, right to left against the already-final left values.
        let mut smoothed = original.clone();
        for i in (2..smoothed.len()).rev() {
            let half = ((smoothed[i - 1] as i32 + smoothed[i - 2] as i32) / 2) as i16;
            smoothed[i] = smoothed[i].wrapping_sub(half);
        }

        let mut restored = smoothed;
        revert_preconditioning(&mut restored);
        assert_eq!(restored, original);
    }

    // --- cell decoding ---

    #[test]
    fn raw_cell_decodes_typed_array() {
        let mut payload = Vec::new();
        for v in [7i16, -7, 512] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let cell = make_cell(&[Transform::Raw], &payload);
        let col = descriptor("StartCellData", 3, ElementType::Short);
        let data = decode_cell(&cell, &col).unwrap();
        assert_eq!(data, ColumnData::Short(vec![7, -7, 512]));
    }

    #[test]
    fn raw_cell_int_column() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&123456i32.to_le_bytes());
        let cell = make_cell(&[Transform::Raw], &payload);
        let col = descriptor("EventNum", 1, ElementType::Int);
        assert_eq!(
            decode_cell(&cell, &col).unwrap(),
            ColumnData::Int(vec![123456])
        );
    }

    #[test]
    fn empty_transform_list_is_verbatim() {
        let payload = 42i32.to_le_bytes();
        let cell = make_cell(&[], &payload);
        let col = descriptor("EventNum", 1, ElementType::Int);
        assert_eq!(decode_cell(&cell, &col).unwrap(), ColumnData::Int(vec![42]));
    }

    #[test]
    fn preconditioning_only_cell() {
        let original: Vec<i16> = vec![5, 9, 12, 20];
        let mut smoothed = original.clone();
        for i in (2..smoothed.len()).rev() {
            let half = ((smoothed[i - 1] as i32 + smoothed[i - 2] as i32) / 2) as i16;
            smoothed[i] = smoothed[i].wrapping_sub(half);
        }
        let mut payload = Vec::new();
        for v in &smoothed {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let cell = make_cell(&[Transform::Preconditioning], &payload);
        let col = descriptor("Data", 4, ElementType::Short);
        assert_eq!(decode_cell(&cell, &col).unwrap(), ColumnData::Short(original));
    }

    #[test]
    fn preconditioning_large_buffer_roundtrip() {
        // A long oscillating buffer with sign changes exercises the
        // truncation direction at scale.
        let original: Vec<i16> = (0..1001)
            .map(|i: i32| ((i * 37 % 211) - 105) as i16)
            .collect();
        let mut smoothed = original.clone();
        for i in (2..smoothed.len()).rev() {
            let half = ((smoothed[i - 1] as i32 + smoothed[i - 2] as i32) / 2) as i16;
            smoothed[i] = smoothed[i].wrapping_sub(half);
        }
        let mut restored = smoothed;
        revert_preconditioning(&mut restored);
        assert_eq!(restored, original);
    }

    #[test]
    fn truncated_cell_is_rejected() {
        let cell = make_cell(&[Transform::Raw], &[0x01]);
        let col = descriptor("StartCellData", 1, ElementType::Short);
        assert!(matches!(decode_cell(&cell, &col), Err(Error::Truncated)));
    }

    #[test]
    fn reinterpret_keeps_shorts_for_byte_column() {
        let data = reinterpret_shorts(vec![-72, -10, -70], ElementType::Byte).unwrap();
        assert_eq!(data, ColumnData::Short(vec![-72, -10, -70]));
    }

    #[test]
    fn reinterpret_widens_to_int() {
        // Two 16-bit halves reassemble into one little-endian 32-bit value.
        let lo = 0x5678u16 as i16;
        let hi = 0x1234u16 as i16;
        let data = reinterpret_shorts(vec![lo, hi], ElementType::Int).unwrap();
        assert_eq!(data, ColumnData::Int(vec![0x12345678]));
    }
}
