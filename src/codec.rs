//! Order-preserving encoding of scalar values into byte keys.
//!
//! Secondary indexes are sorted byte ranges, so the encoding of a scalar
//! value must preserve the value's natural ordering once compared
//! lexicographically as bytes. This module is the only place that knows how
//! to turn a declared attribute value into such a byte sequence, and how to
//! pack/split the composite `(valuePrefix, primaryKey)` keys that secondary
//! index tables actually store.

use thiserror::Error;

/// Errors produced while encoding or composing index keys.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A fixed-point decimal value did not fit in the declared scale.
    #[error("decimal value does not fit after scaling: {0}")]
    Overflow(String),

    /// A decimal scalar was encoded without a declared `scale`.
    #[error("decimal scalar requires a declared scale")]
    ConfigRequired,

    /// A primary key was too long to be length-prefixed with `u16`.
    #[error("primary key length {0} exceeds u16::MAX")]
    PrimaryKeyTooLong(usize),
}

/// A tagged scalar value produced by the table layer from a declared
/// attribute, dispatched on the variant rather than on runtime type
/// introspection.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Guid([u8; 16]),
    /// Fixed-point decimal. `value * 10^scale` is truncated to a signed
    /// 64-bit integer before encoding.
    Dec { value: f64, scale: u32 },
}

/// Order-preserving codec for [`Scalar`] values and composite index keys.
pub struct IndexKeyCodec;

impl IndexKeyCodec {
    /// Encode a scalar to bytes whose lexicographic (unsigned byte) order
    /// matches the value's natural order.
    pub fn encode(scalar: &Scalar) -> Result<Vec<u8>, CodecError> {
        match scalar {
            Scalar::Bytes(b) => Ok(b.clone()),
            Scalar::Str(s) => Ok(s.as_bytes().to_vec()),
            Scalar::U64(v) => Ok(v.to_be_bytes().to_vec()),
            Scalar::I64(v) => Ok(Self::encode_i64(*v)),
            Scalar::F64(v) => Ok(Self::encode_f64(*v)),
            Scalar::Guid(g) => Ok(g.to_vec()),
            Scalar::Dec { value, scale } => Self::encode_decimal(*value, *scale),
        }
    }

    /// Signed integer: big-endian with the sign bit flipped, so that
    /// negative values sort before positive ones as unsigned bytes.
    fn encode_i64(v: i64) -> Vec<u8> {
        let flipped = (v as u64) ^ (1u64 << 63);
        flipped.to_be_bytes().to_vec()
    }

    fn decode_i64(buf: &[u8; 8]) -> i64 {
        let flipped = u64::from_be_bytes(*buf);
        (flipped ^ (1u64 << 63)) as i64
    }

    /// IEEE-754 float: read as unsigned bits; if the sign bit is set,
    /// invert all bits (so more-negative sorts first); else flip only the
    /// sign bit (so positives sort after all negatives).
    fn encode_f64(v: f64) -> Vec<u8> {
        let bits = v.to_bits();
        let mapped = if bits & (1u64 << 63) != 0 {
            !bits
        } else {
            bits | (1u64 << 63)
        };
        mapped.to_be_bytes().to_vec()
    }

    fn decode_f64(buf: &[u8; 8]) -> f64 {
        let mapped = u64::from_be_bytes(*buf);
        let bits = if mapped & (1u64 << 63) != 0 {
            mapped & !(1u64 << 63)
        } else {
            !mapped
        };
        f64::from_bits(bits)
    }

    fn encode_decimal(value: f64, scale: u32) -> Result<Vec<u8>, CodecError> {
        let factor = 10f64.powi(scale as i32);
        let scaled = (value * factor).trunc();
        if !scaled.is_finite() || scaled > i64::MAX as f64 || scaled < i64::MIN as f64 {
            return Err(CodecError::Overflow(format!(
                "{value} at scale {scale} does not fit in i64"
            )));
        }
        Ok(Self::encode_i64(scaled as i64))
    }

    /// Returns the smallest byte sequence strictly greater than every
    /// sequence starting with `prefix`. An empty return value means
    /// "unbounded above" (no finite upper bound exists, because `prefix`
    /// is all `0xFF` bytes or empty).
    pub fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
        let mut out = prefix.to_vec();
        while let Some(&last) = out.last() {
            if last < 0xFF {
                *out.last_mut().expect("checked non-empty above") = last + 1;
                return out;
            }
            out.pop();
        }
        Vec::new()
    }

    /// `valuePrefix ∥ pk ∥ len(pk):u16-BE`.
    pub fn compose_index_entry_key(value_prefix: &[u8], pk: &[u8]) -> Result<Vec<u8>, CodecError> {
        let pk_len: u16 = u16::try_from(pk.len())
            .map_err(|_| CodecError::PrimaryKeyTooLong(pk.len()))?;
        let mut out = Vec::with_capacity(value_prefix.len() + pk.len() + 2);
        out.extend_from_slice(value_prefix);
        out.extend_from_slice(pk);
        out.extend_from_slice(&pk_len.to_be_bytes());
        Ok(out)
    }

    /// Splits a composite key into `(valuePrefix, pk)`. Returns `None` if
    /// the key is shorter than the trailing length field or the declared
    /// pk length doesn't fit.
    pub fn split_index_entry_key(key: &[u8]) -> Option<(&[u8], &[u8])> {
        if key.len() < 2 {
            return None;
        }
        let (body, len_bytes) = key.split_at(key.len() - 2);
        let pk_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        if pk_len > body.len() {
            return None;
        }
        let split_at = body.len() - pk_len;
        Some((&body[..split_at], &body[split_at..]))
    }

    /// Extracts just the primary key from a composite index key.
    pub fn extract_primary_key(key: &[u8]) -> Option<&[u8]> {
        Self::split_index_entry_key(key).map(|(_, pk)| pk)
    }

    /// Extracts just the value prefix from a composite index key.
    pub fn extract_value_prefix(key: &[u8]) -> Option<&[u8]> {
        Self::split_index_entry_key(key).map(|(prefix, _)| prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_roundtrip_and_order() {
        let a = IndexKeyCodec::encode(&Scalar::U64(10)).unwrap();
        let b = IndexKeyCodec::encode(&Scalar::U64(200)).unwrap();
        assert!(a < b);
    }

    #[test]
    fn signed_order_crosses_zero_correctly() {
        let neg = IndexKeyCodec::encode(&Scalar::I64(-5)).unwrap();
        let zero = IndexKeyCodec::encode(&Scalar::I64(0)).unwrap();
        let pos = IndexKeyCodec::encode(&Scalar::I64(5)).unwrap();
        assert!(neg < zero);
        assert!(zero < pos);
    }

    #[test]
    fn signed_roundtrip() {
        for v in [i64::MIN, -1, 0, 1, i64::MAX] {
            let encoded = IndexKeyCodec::encode_i64(v);
            let arr: [u8; 8] = encoded.try_into().unwrap();
            assert_eq!(IndexKeyCodec::decode_i64(&arr), v);
        }
    }

    #[test]
    fn float_order_matches_value_order() {
        let values = [-100.5, -1.0, -0.0, 0.0, 0.5, 1.0, 100.5];
        let mut encoded: Vec<Vec<u8>> = values
            .iter()
            .map(|v| IndexKeyCodec::encode(&Scalar::F64(*v)).unwrap())
            .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        encoded.dedup();
        sorted.dedup();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn float_roundtrip() {
        for v in [-100.5_f64, -1.0, 0.0, 0.5, 1.0, 100.5, f64::MAX, f64::MIN] {
            let encoded = IndexKeyCodec::encode(&Scalar::F64(v)).unwrap();
            let arr: [u8; 8] = encoded.try_into().unwrap();
            assert_eq!(IndexKeyCodec::decode_f64(&arr), v);
        }
    }

    #[test]
    fn decimal_requires_scale_is_caller_enforced_and_overflows_are_caught() {
        let err = IndexKeyCodec::encode(&Scalar::Dec {
            value: 1e30,
            scale: 2,
        });
        assert!(matches!(err, Err(CodecError::Overflow(_))));
    }

    #[test]
    fn decimal_preserves_order() {
        let a = IndexKeyCodec::encode(&Scalar::Dec {
            value: 1.23,
            scale: 2,
        })
        .unwrap();
        let b = IndexKeyCodec::encode(&Scalar::Dec {
            value: 1.24,
            scale: 2,
        })
        .unwrap();
        assert!(a < b);
    }

    #[test]
    fn prefix_upper_bound_basic() {
        assert_eq!(IndexKeyCodec::prefix_upper_bound(&[1, 2, 3]), vec![1, 2, 4]);
        assert_eq!(IndexKeyCodec::prefix_upper_bound(&[1, 0xFF]), vec![2]);
        assert_eq!(
            IndexKeyCodec::prefix_upper_bound(&[0xFF, 0xFF]),
            Vec::<u8>::new()
        );
        assert_eq!(IndexKeyCodec::prefix_upper_bound(&[]), Vec::<u8>::new());
    }

    #[test]
    fn prefix_upper_bound_is_strictly_greater_than_any_extension() {
        let prefix = vec![5, 6];
        let bound = IndexKeyCodec::prefix_upper_bound(&prefix);
        for suffix in [vec![], vec![0], vec![0xFF, 0xFF]] {
            let mut q = prefix.clone();
            q.extend(suffix);
            assert!(q < bound, "{q:?} should be < {bound:?}");
        }
    }

    #[test]
    fn composite_split_roundtrip() {
        let prefix = b"abc".to_vec();
        let pk = b"primary-key-1".to_vec();
        let key = IndexKeyCodec::compose_index_entry_key(&prefix, &pk).unwrap();
        let (got_prefix, got_pk) = IndexKeyCodec::split_index_entry_key(&key).unwrap();
        assert_eq!(got_prefix, prefix.as_slice());
        assert_eq!(got_pk, pk.as_slice());
    }

    #[test]
    fn composite_keys_sort_by_value_then_pk() {
        let k1 = IndexKeyCodec::compose_index_entry_key(b"aa", b"1").unwrap();
        let k2 = IndexKeyCodec::compose_index_entry_key(b"aa", b"2").unwrap();
        let k3 = IndexKeyCodec::compose_index_entry_key(b"ab", b"0").unwrap();
        assert!(k1 < k2);
        assert!(k2 < k3);
    }

    #[test]
    fn split_rejects_truncated_keys() {
        assert!(IndexKeyCodec::split_index_entry_key(&[0]).is_none());
        assert!(IndexKeyCodec::split_index_entry_key(&[0, 0]).is_some());
    }
}
