use std::fmt;

/// Cache line size on every ISA we target
pub const CACHE_LINE_SIZE: usize = 64;

/// Round up to a multiple of `align` (which must be a power of two)
pub const fn roundto(num: usize, align: usize) -> usize {
    (num + align - 1) & !(align - 1)
}

/// Wrapper so that pointers show up as bare hex addresses in tracing events
/// and debug output instead of `0x... as *const _` noise
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UsizePtr(pub usize);

impl<T> From<*const T> for UsizePtr {
    #[inline]
    fn from(p: *const T) -> Self {
        Self(p as usize)
    }
}
impl<T> From<*mut T> for UsizePtr {
    #[inline]
    fn from(p: *mut T) -> Self {
        Self(p as usize)
    }
}

impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Hint-prefetch `p` ahead of an imminent write to it
#[inline(always)]
pub fn prefetch_write<T>(p: *const T) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(p as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = p;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundto_test() {
        assert_eq!(roundto(0, 64), 0);
        assert_eq!(roundto(1, 64), 64);
        assert_eq!(roundto(64, 64), 64);
        assert_eq!(roundto(65, 64), 128);
        assert_eq!(roundto(13, 8), 16);
    }

    #[test]
    fn usize_ptr_debug_test() {
        let x = 0xdead_beefusize as *const u8;
        assert_eq!(format!("{:?}", UsizePtr::from(x)), "0xdeadbeef");
    }
}
