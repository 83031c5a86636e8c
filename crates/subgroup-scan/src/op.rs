//! Combining operators.
//!
//! Every kernel is generic over a [`CombineOp`]: an associative, commutative
//! binary operator with an identity. Padding lanes contribute the identity.

use crate::capability::SubgroupOperations;
use crate::element::Element;
use core::fmt;

/// Defines the class of group operation a kernel performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupOperation {
    /// The combine of all values.
    Reduce,
    /// `[a0, (a0 op a1), … (a0 op a1 op … op an-1)]`.
    InclusiveScan,
    /// `[I, a0, (a0 op a1), … (a0 op a1 op … op an-2)]`.
    ExclusiveScan,
}

pub trait CombineOp<T: Element>: Copy + Default + Send + Sync + fmt::Debug + 'static {
    /// Short name, used in labels and pipeline cache keys.
    const NAME: &'static str;
    /// Native WGSL subgroup reduction, e.g. `subgroupAdd`.
    const WGSL_SUBGROUP_REDUCE: &'static str;
    /// Native WGSL inclusive subgroup scan. `None` builds the scan from
    /// `subgroupShuffleUp`, which needs [`SubgroupOperations::SHUFFLE_RELATIVE`].
    const WGSL_SUBGROUP_INCLUSIVE_SCAN: Option<&'static str>;

    fn identity() -> T;

    fn combine(a: T, b: T) -> T;

    /// WGSL expression combining the expressions `a` and `b`.
    fn wgsl_combine(a: &str, b: &str) -> String;

    /// Subgroup operation classes `operation` compiles to with this operator.
    fn required_operations(operation: GroupOperation) -> SubgroupOperations {
        let arithmetic = SubgroupOperations::BASIC | SubgroupOperations::ARITHMETIC;
        match operation {
            GroupOperation::InclusiveScan | GroupOperation::ExclusiveScan
                if Self::WGSL_SUBGROUP_INCLUSIVE_SCAN.is_none() =>
            {
                arithmetic | SubgroupOperations::SHUFFLE_RELATIVE
            }
            _ => arithmetic,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl<T: Element> CombineOp<T> for Sum {
    const NAME: &'static str = "sum";
    const WGSL_SUBGROUP_REDUCE: &'static str = "subgroupAdd";
    const WGSL_SUBGROUP_INCLUSIVE_SCAN: Option<&'static str> = Some("subgroupInclusiveAdd");

    fn identity() -> T {
        T::ZERO
    }

    fn combine(a: T, b: T) -> T {
        Element::add(a, b)
    }

    fn wgsl_combine(a: &str, b: &str) -> String {
        format!("({a} + {b})")
    }
}

impl<T: Element> CombineOp<T> for Max {
    const NAME: &'static str = "max";
    const WGSL_SUBGROUP_REDUCE: &'static str = "subgroupMax";
    const WGSL_SUBGROUP_INCLUSIVE_SCAN: Option<&'static str> = None;

    fn identity() -> T {
        T::LOWEST
    }

    fn combine(a: T, b: T) -> T {
        a.maximum(b)
    }

    fn wgsl_combine(a: &str, b: &str) -> String {
        format!("max({a}, {b})")
    }
}

impl<T: Element> CombineOp<T> for Min {
    const NAME: &'static str = "min";
    const WGSL_SUBGROUP_REDUCE: &'static str = "subgroupMin";
    const WGSL_SUBGROUP_INCLUSIVE_SCAN: Option<&'static str> = None;

    fn identity() -> T {
        T::HIGHEST
    }

    fn combine(a: T, b: T) -> T {
        a.minimum(b)
    }

    fn wgsl_combine(a: &str, b: &str) -> String {
        format!("min({a}, {b})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_identity<T: Element, O: CombineOp<T>>(samples: &[T]) {
        for &x in samples {
            assert_eq!(O::combine(O::identity(), x), x, "{} {x:?}", O::NAME);
            assert_eq!(O::combine(x, O::identity()), x, "{} {x:?}", O::NAME);
        }
    }

    #[test]
    fn identities_are_neutral() {
        let floats = [0.0f32, -1.5, 3.25, f32::MAX, f32::MIN];
        check_identity::<f32, Sum>(&floats);
        check_identity::<f32, Max>(&floats);
        check_identity::<f32, Min>(&floats);

        let signed = [0i32, -7, 42, i32::MIN, i32::MAX];
        check_identity::<i32, Sum>(&signed);
        check_identity::<i32, Max>(&signed);
        check_identity::<i32, Min>(&signed);

        let unsigned = [0u32, 1, 99, u32::MAX];
        check_identity::<u32, Sum>(&unsigned);
        check_identity::<u32, Max>(&unsigned);
        check_identity::<u32, Min>(&unsigned);
    }

    #[test]
    fn scans_without_native_instruction_need_relative_shuffles() {
        let needs_shuffle = |ops: SubgroupOperations| ops.contains(SubgroupOperations::SHUFFLE_RELATIVE);
        assert!(!needs_shuffle(<Sum as CombineOp<f32>>::required_operations(
            GroupOperation::InclusiveScan
        )));
        assert!(needs_shuffle(<Max as CombineOp<f32>>::required_operations(
            GroupOperation::ExclusiveScan
        )));
        assert!(!needs_shuffle(<Min as CombineOp<i32>>::required_operations(
            GroupOperation::Reduce
        )));
    }
}
