//! Bit-sliced index over signed 64-bit values.
//!
//! Values are offset by the sign bit (`v ^ 1 << 63`) so that unsigned bit
//! order matches signed order. Plane `i` holds every row whose offset value
//! has bit `i` set; the existence bitmap holds every row with a value.
//!
//! ```text
//! exists   : rows with a non-null value
//! plane[0] : rows with bit 0 set
//! ...
//! plane[63]: rows with bit 63 set (non-negative values)
//! ```
//!
//! Range comparisons walk the planes most-significant first, keeping the
//! rows still equal to the target prefix and peeling off rows that are
//! already known to be greater or smaller.

use std::io::{Read, Write};

use roaring::RoaringBitmap;

use crate::error::{EngineError, Result};

/// Number of bit planes; one per bit of an `i64`.
pub const BIT_DEPTH: usize = 64;

const SIGN: u64 = 1 << 63;

#[inline]
fn encode(value: i64) -> u64 {
    (value as u64) ^ SIGN
}

#[inline]
fn decode(bits: u64) -> i64 {
    (bits ^ SIGN) as i64
}

/// Comparison evaluated against a [`Bsi`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Eq(i64),
    Lt(i64),
    Le(i64),
    Gt(i64),
    Ge(i64),
    /// Inclusive on both ends.
    Between(i64, i64),
}

/// Sum and count of the values under a row selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aggregate {
    pub sum: i128,
    pub count: u64,
}

impl Aggregate {
    pub fn merge(&mut self, other: Aggregate) {
        self.sum += other.sum;
        self.count += other.count;
    }
}

/// Bit-sliced index for one integer column.
#[derive(Debug, Clone, PartialEq)]
pub struct Bsi {
    exists: RoaringBitmap,
    planes: Vec<RoaringBitmap>,
}

impl Bsi {
    pub fn new() -> Self {
        Self {
            exists: RoaringBitmap::new(),
            planes: vec![RoaringBitmap::new(); BIT_DEPTH],
        }
    }

    /// Record `value` for `row`. Cost is O(popcount(encoded value)).
    ///
    /// Rows are expected to be set once; setting a row twice ORs the bits.
    pub fn set_value(&mut self, row: u32, value: i64) {
        let mut bits = encode(value);
        while bits != 0 {
            let i = bits.trailing_zeros() as usize;
            self.planes[i].insert(row);
            bits &= bits - 1;
        }
        self.exists.insert(row);
    }

    pub fn get_value(&self, row: u32) -> Option<i64> {
        if !self.exists.contains(row) {
            return None;
        }
        let mut bits = 0u64;
        for (i, plane) in self.planes.iter().enumerate() {
            if plane.contains(row) {
                bits |= 1 << i;
            }
        }
        Some(decode(bits))
    }

    pub fn exists(&self) -> &RoaringBitmap {
        &self.exists
    }

    pub fn len(&self) -> u64 {
        self.exists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exists.is_empty()
    }

    /// Rows in `candidates` whose value satisfies `op`.
    pub fn compare(&self, op: RangeOp, candidates: &RoaringBitmap) -> RoaringBitmap {
        match op {
            RangeOp::Between(lo, hi) => {
                if lo > hi {
                    return RoaringBitmap::new();
                }
                let lower = self.scan(lo, candidates);
                let mut ge = lower.gt;
                ge |= &lower.eq;
                let upper = self.scan(hi, &ge);
                let mut out = upper.lt;
                out |= &upper.eq;
                out
            }
            RangeOp::Eq(v) => self.scan(v, candidates).eq,
            RangeOp::Lt(v) => self.scan(v, candidates).lt,
            RangeOp::Gt(v) => self.scan(v, candidates).gt,
            RangeOp::Le(v) => {
                let s = self.scan(v, candidates);
                let mut out = s.lt;
                out |= &s.eq;
                out
            }
            RangeOp::Ge(v) => {
                let s = self.scan(v, candidates);
                let mut out = s.gt;
                out |= &s.eq;
                out
            }
        }
    }

    /// Most-significant-plane-first split of `candidates` against `target`.
    fn scan(&self, target: i64, candidates: &RoaringBitmap) -> Split {
        let target = encode(target);
        let mut eq = candidates & &self.exists;
        let mut lt = RoaringBitmap::new();
        let mut gt = RoaringBitmap::new();

        for i in (0..BIT_DEPTH).rev() {
            if eq.is_empty() {
                break;
            }
            let plane = &self.planes[i];
            if target & (1 << i) != 0 {
                lt |= &eq - plane;
                eq &= plane;
            } else {
                gt |= &eq & plane;
                eq -= plane;
            }
        }

        Split { lt, eq, gt }
    }

    /// Sum and count over `selection` without decoding individual rows.
    pub fn sum(&self, selection: &RoaringBitmap) -> Aggregate {
        let count = self.exists.intersection_len(selection);
        if count == 0 {
            return Aggregate::default();
        }
        let mut unsigned: i128 = 0;
        for (i, plane) in self.planes.iter().enumerate() {
            let ones = plane.intersection_len(selection) as i128;
            unsigned += ones << i;
        }
        // Undo the sign-bit offset once per counted value.
        let sum = unsigned - (count as i128) * (SIGN as i128);
        Aggregate { sum, count }
    }

    pub fn serialized_size(&self) -> usize {
        4 + self.exists.serialized_size()
            + self
                .planes
                .iter()
                .map(|p| 4 + p.serialized_size())
                .sum::<usize>()
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_bitmap(&self.exists, w)?;
        for plane in &self.planes {
            write_bitmap(plane, w)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let exists = read_bitmap(r)?;
        let mut planes = Vec::with_capacity(BIT_DEPTH);
        for _ in 0..BIT_DEPTH {
            let plane = read_bitmap(r)?;
            if !plane.is_subset(&exists) {
                return Err(EngineError::InvalidFormat(
                    "BSI plane is not a subset of its existence bitmap".into(),
                ));
            }
            planes.push(plane);
        }
        Ok(Self { exists, planes })
    }
}

impl Default for Bsi {
    fn default() -> Self {
        Self::new()
    }
}

struct Split {
    lt: RoaringBitmap,
    eq: RoaringBitmap,
    gt: RoaringBitmap,
}

/// Write a length-prefixed roaring bitmap.
pub(crate) fn write_bitmap<W: Write>(bitmap: &RoaringBitmap, w: &mut W) -> Result<()> {
    w.write_all(&(bitmap.serialized_size() as u32).to_le_bytes())?;
    bitmap.serialize_into(w)?;
    Ok(())
}

/// Read a length-prefixed roaring bitmap.
pub(crate) fn read_bitmap<R: Read>(r: &mut R) -> Result<RoaringBitmap> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).map_err(|e| {
        EngineError::InvalidFormat(format!("Failed to read bitmap length: {}", e))
    })?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|e| EngineError::InvalidFormat(format!("Bitmap truncated: {}", e)))?;
    RoaringBitmap::deserialize_from(&buf[..])
        .map_err(|e| EngineError::InvalidFormat(format!("Bad bitmap: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn build(values: &[i64]) -> Bsi {
        let mut bsi = Bsi::new();
        for (row, &v) in values.iter().enumerate() {
            bsi.set_value(row as u32, v);
        }
        bsi
    }

    fn all(n: usize) -> RoaringBitmap {
        let mut bm = RoaringBitmap::new();
        bm.insert_range(0..n as u32);
        bm
    }

    fn rows(bm: &RoaringBitmap) -> Vec<u32> {
        bm.iter().collect()
    }

    #[test]
    fn test_get_missing_row() {
        let bsi = build(&[5]);
        assert_eq!(bsi.get_value(0), Some(5));
        assert_eq!(bsi.get_value(1), None);
    }

    #[test]
    fn test_extremes_roundtrip() {
        let values = [i64::MIN, -1, 0, 1, i64::MAX];
        let bsi = build(&values);
        for (row, &v) in values.iter().enumerate() {
            assert_eq!(bsi.get_value(row as u32), Some(v));
        }
    }

    #[test]
    fn test_planes_subset_of_exists() {
        let bsi = build(&[-7, 0, 42, i64::MAX]);
        for plane in &bsi.planes {
            assert!(plane.is_subset(&bsi.exists));
        }
    }

    #[test]
    fn test_compare_ops() {
        let values = [-10, -1, 0, 3, 3, 7, 100];
        let bsi = build(&values);
        let c = all(values.len());

        assert_eq!(rows(&bsi.compare(RangeOp::Eq(3), &c)), vec![3, 4]);
        assert_eq!(rows(&bsi.compare(RangeOp::Lt(0), &c)), vec![0, 1]);
        assert_eq!(rows(&bsi.compare(RangeOp::Le(0), &c)), vec![0, 1, 2]);
        assert_eq!(rows(&bsi.compare(RangeOp::Gt(3), &c)), vec![5, 6]);
        assert_eq!(rows(&bsi.compare(RangeOp::Ge(3), &c)), vec![3, 4, 5, 6]);
        assert_eq!(
            rows(&bsi.compare(RangeOp::Between(-1, 7), &c)),
            vec![1, 2, 3, 4, 5]
        );
        assert!(bsi.compare(RangeOp::Between(7, -1), &c).is_empty());
    }

    #[test]
    fn test_compare_respects_candidates() {
        let bsi = build(&[1, 2, 3, 4]);
        let mut c = RoaringBitmap::new();
        c.insert(0);
        c.insert(3);
        assert_eq!(rows(&bsi.compare(RangeOp::Ge(1), &c)), vec![0, 3]);
    }

    #[test]
    fn test_compare_skips_missing_rows() {
        let mut bsi = Bsi::new();
        bsi.set_value(0, 5);
        bsi.set_value(2, 5);
        assert_eq!(rows(&bsi.compare(RangeOp::Eq(5), &all(3))), vec![0, 2]);
        assert_eq!(rows(&bsi.compare(RangeOp::Lt(100), &all(3))), vec![0, 2]);
    }

    #[test]
    fn test_sum_signed() {
        let values = [-10, -1, 0, 3, 3, 7, 100];
        let bsi = build(&values);
        let agg = bsi.sum(&all(values.len()));
        assert_eq!(agg.count, 7);
        assert_eq!(agg.sum, 102);

        let mut sel = RoaringBitmap::new();
        sel.insert(0);
        sel.insert(1);
        assert_eq!(bsi.sum(&sel), Aggregate { sum: -11, count: 2 });
    }

    #[test]
    fn test_sum_extremes_does_not_overflow() {
        let bsi = build(&[i64::MAX, i64::MAX, i64::MIN]);
        let agg = bsi.sum(&all(3));
        assert_eq!(agg.sum, i64::MAX as i128 * 2 + i64::MIN as i128);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let bsi = build(&[-3, 9, 0, 12345]);
        let mut buf = Vec::new();
        bsi.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), bsi.serialized_size());
        let loaded = Bsi::read_from(&mut &buf[..]).unwrap();
        assert_eq!(loaded, bsi);
    }

    #[test]
    fn test_read_truncated() {
        let bsi = build(&[1, 2]);
        let mut buf = Vec::new();
        bsi.write_to(&mut buf).unwrap();
        let err = Bsi::read_from(&mut &buf[..buf.len() - 3]).unwrap_err();
        assert!(err.to_string().contains("Bitmap truncated"), "{}", err);
    }

    proptest! {
        #[test]
        fn prop_value_roundtrip(v in any::<i64>(), row in 0u32..1_000_000) {
            let mut bsi = Bsi::new();
            bsi.set_value(row, v);
            prop_assert_eq!(bsi.get_value(row), Some(v));
        }

        #[test]
        fn prop_compare_matches_linear(
            values in proptest::collection::vec(-50i64..50, 1..64),
            target in -60i64..60,
        ) {
            let bsi = build(&values);
            let c = all(values.len());
            let expect = |f: &dyn Fn(i64) -> bool| -> Vec<u32> {
                values.iter().enumerate().filter(|(_, &v)| f(v)).map(|(i, _)| i as u32).collect()
            };
            prop_assert_eq!(rows(&bsi.compare(RangeOp::Lt(target), &c)), expect(&|v| v < target));
            prop_assert_eq!(rows(&bsi.compare(RangeOp::Ge(target), &c)), expect(&|v| v >= target));
            prop_assert_eq!(rows(&bsi.compare(RangeOp::Eq(target), &c)), expect(&|v| v == target));
            let sum: i128 = values.iter().map(|&v| v as i128).sum();
            prop_assert_eq!(bsi.sum(&c).sum, sum);
        }
    }
}
