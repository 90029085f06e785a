//! Low-level persistence primitives

#![allow(unused)]

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{_mm_clflush, _mm_mfence, _mm_sfence};

/// Synchronizes caches and memories and acts like a write barrier
#[inline(always)]
pub fn persist<T: ?Sized>(ptr: &T, len: usize, fence: bool) {
    #[cfg(not(feature = "no_persist"))]
    {
        #[cfg(not(feature = "use_msync"))]
        {
            clflush(ptr, len);
            if fence {
                sfence();
            }
        }

        #[cfg(feature = "use_msync")]
        msync(ptr, len);
    }
}

/// Synchronizes the cache lines of a whole object
#[inline(always)]
pub fn persist_obj<T: ?Sized>(obj: &T, fence: bool) {
    persist(obj, std::mem::size_of_val(obj), fence)
}

/// Flushes cache lines back to memory without a trailing fence
#[inline(always)]
pub fn clflush<T: ?Sized>(ptr: &T, len: usize) {
    #[cfg(not(feature = "no_persist"))]
    {
        let ptr = ptr as *const _ as *const u8;
        let mut start = (ptr as usize >> 6) << 6;
        let end = ptr as usize + len;
        while start < end {
            #[cfg(target_arch = "x86_64")]
            unsafe {
                _mm_clflush(start as *const u8);
            }
            start += 64;
        }
    }
}

/// Synchronizes a page-aligned superset of the range with the backing file
#[inline]
pub fn msync<T: ?Sized>(ptr: &T, len: usize) {
    #[cfg(not(feature = "no_persist"))]
    unsafe {
        let off = ptr as *const T as *const u8 as usize;
        let end = off + len;
        let off = (off >> 12) << 12;
        let len = end - off;
        if libc::msync(
            off as *mut libc::c_void,
            len,
            libc::MS_SYNC | libc::MS_INVALIDATE,
        ) != 0
        {
            panic!("msync failed");
        }
    }
}

/// Store fence
#[inline(always)]
pub fn sfence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        _mm_sfence();
    }
}

/// Memory fence
#[inline]
pub fn mfence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        _mm_mfence();
    }
}
