//! Fixed-order host versions of the operations.
//!
//! These combine strictly left to right. The engine never falls back to
//! them; callers that want a bit-reproducible result, or have no capable
//! device, call them directly.

use crate::element::Element;
use crate::op::CombineOp;

pub fn reduce<T: Element, O: CombineOp<T>>(values: &[T]) -> T {
    values.iter().fold(O::identity(), |acc, &v| O::combine(acc, v))
}

pub fn scan_inclusive<T: Element, O: CombineOp<T>>(values: &[T]) -> Vec<T> {
    values
        .iter()
        .scan(O::identity(), |acc, &v| {
            *acc = O::combine(*acc, v);
            Some(*acc)
        })
        .collect()
}

pub fn scan_exclusive<T: Element, O: CombineOp<T>>(values: &[T]) -> Vec<T> {
    values
        .iter()
        .scan(O::identity(), |acc, &v| {
            let before = *acc;
            *acc = O::combine(*acc, v);
            Some(before)
        })
        .collect()
}
