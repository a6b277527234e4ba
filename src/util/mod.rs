#[cold]
const fn cold() {}

/// Branch-prediction hint: the condition is expected not to hold.
#[inline]
pub(crate) const fn unlikely(b: bool) -> bool {
    if b {
        cold();
    }
    b
}
