//! Marker trait for types that may live inside an attachable region.

/// Types that can be stored in a region-backed container.
///
/// # Safety
///
/// Implementors must be plain data: `Copy`, no padding-dependent invariants,
/// no pointers into the owning process, and every bit pattern of the
/// underlying bytes must be a valid value (an attached region may contain
/// bytes written by a previous process). `#[repr(C)]` structs of `Serial`
/// fields qualify.
pub unsafe trait Serial: Copy {}

unsafe impl Serial for u8 {}
unsafe impl Serial for u16 {}
unsafe impl Serial for u32 {}
unsafe impl Serial for u64 {}
unsafe impl Serial for usize {}
unsafe impl Serial for i8 {}
unsafe impl Serial for i16 {}
unsafe impl Serial for i32 {}
unsafe impl Serial for i64 {}
unsafe impl Serial for isize {}
unsafe impl Serial for f32 {}
unsafe impl Serial for f64 {}
unsafe impl Serial for () {}

unsafe impl<T: Serial, const N: usize> Serial for [T; N] {}
