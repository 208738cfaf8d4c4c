//! Small value helpers shared by the loop and the `tether` crate.

/// A plain pair with no constructor, no `Drop` and no custom assignment.
///
/// Lock-free queues want elements that are trivially copyable; `(A, B)` is
/// fine in Rust but has no guaranteed layout, so the wake queue uses this.
/// Build it with a struct literal: `TrivialPair { first, second }`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TrivialPair<A, B> {
    pub first: A,
    pub second: B,
}

/// Compare a value against any number of candidates.
///
/// Expands to `(v == a) || (v == b) || ...`. With no candidates it is `false`.
///
/// ```
/// use tether_rt::is_any;
/// assert!(is_any!(3, 1, 2, 3));
/// assert!(!is_any!(3));
/// ```
#[macro_export]
macro_rules! is_any {
    ($val:expr $(,)?) => {{
        let _ = &$val;
        false
    }};
    ($val:expr, $($other:expr),+ $(,)?) => {{
        let v = &$val;
        false $(|| *v == $other)+
    }};
}

/// Clamp `v` into `[lo, hi]` using `less` as the ordering.
///
/// `hi` must not be less than `lo`.
pub fn clamp_by<T, F>(v: T, lo: T, hi: T, mut less: F) -> T
where
    F: FnMut(&T, &T) -> bool,
{
    debug_assert!(!less(&hi, &lo), "clamp: hi < lo");

    if less(&v, &lo) {
        lo
    } else if less(&hi, &v) {
        hi
    } else {
        v
    }
}

/// Clamp `v` into `[lo, hi]` with the natural ordering.
///
/// Works for partially ordered values (floats) as well; a NaN `v` is
/// returned unchanged.
pub fn clamp<T: PartialOrd>(v: T, lo: T, hi: T) -> T {
    clamp_by(v, lo, hi, |a, b| a < b)
}
