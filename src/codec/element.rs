//! Fixed-size element layouts for tile payloads

use crate::model::{Point2d, Point3d};
use bytes::BufMut;

/// A value stored as a fixed number of little-endian bytes
pub trait Element: Copy + Default + PartialEq + Send + Sync + 'static {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Append the encoded value
    fn put(&self, out: &mut Vec<u8>);

    /// Decode from exactly [`Self::SIZE`] bytes
    fn get(bytes: &[u8]) -> Self;
}

fn le_f64(bytes: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    f64::from_le_bytes(raw)
}

impl Element for Point3d {
    const SIZE: usize = 24;

    fn put(&self, out: &mut Vec<u8>) {
        out.put_f64_le(self.x);
        out.put_f64_le(self.y);
        out.put_f64_le(self.z);
    }

    fn get(bytes: &[u8]) -> Self {
        Point3d::new(le_f64(&bytes[0..]), le_f64(&bytes[8..]), le_f64(&bytes[16..]))
    }
}

impl Element for Point2d {
    const SIZE: usize = 16;

    fn put(&self, out: &mut Vec<u8>) {
        out.put_f64_le(self.x);
        out.put_f64_le(self.y);
    }

    fn get(bytes: &[u8]) -> Self {
        Point2d::new(le_f64(&bytes[0..]), le_f64(&bytes[8..]))
    }
}

impl Element for i32 {
    const SIZE: usize = 4;

    fn put(&self, out: &mut Vec<u8>) {
        out.put_i32_le(*self);
    }

    fn get(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        i32::from_le_bytes(raw)
    }
}

impl Element for u8 {
    const SIZE: usize = 1;

    fn put(&self, out: &mut Vec<u8>) {
        out.push(*self);
    }

    fn get(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

/// Encode a slice of elements into one contiguous buffer
pub fn encode_elements<T: Element>(elements: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(elements.len() * T::SIZE);
    for element in elements {
        element.put(&mut out);
    }
    out
}

/// Decode up to `max_elements` whole elements; a trailing partial element is ignored
pub fn decode_elements<T: Element>(bytes: &[u8], max_elements: usize) -> Vec<T> {
    bytes
        .chunks_exact(T::SIZE)
        .take(max_elements)
        .map(T::get)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_layout_is_little_endian() {
        let encoded = encode_elements(&[Point3d::new(1.0, 2.0, 3.0)]);
        assert_eq!(encoded.len(), 24);
        assert_eq!(&encoded[0..8], &1.0f64.to_le_bytes());
        assert_eq!(&encoded[16..24], &3.0f64.to_le_bytes());
    }

    #[test]
    fn test_decode_respects_max() {
        let indices = [1i32, -2, 3, 4];
        let encoded = encode_elements(&indices);
        assert_eq!(decode_elements::<i32>(&encoded, 2), vec![1, -2]);
        assert_eq!(decode_elements::<i32>(&encoded, 10), indices.to_vec());
    }

    #[test]
    fn test_uv_layout() {
        let uvs = [Point2d::new(0.25, 0.75)];
        let encoded = encode_elements(&uvs);
        assert_eq!(encoded.len(), Point2d::SIZE);
        assert_eq!(decode_elements::<Point2d>(&encoded, 1), uvs.to_vec());
    }
}
