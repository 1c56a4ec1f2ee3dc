//! The reference-counted heap shared by VM runtime payloads: strings,
//! typed arrays, and objects (§4.B, component C2).
//!
//! A single `Header` precedes every payload. All accessors are null-safe
//! (a null payload behaves as an empty one) because the VM routinely
//! carries payload pointers through `Slot`s that may never have been
//! initialized.
//!
//! Reference counts here are non-atomic `Cell<u32>`s: the VM is
//! single-threaded within one `VM::run` (§5), so there is no benefit to
//! paying for atomics. An embedder that shares a heap across threads
//! would need to swap this module for an atomic-refcount variant; see
//! DESIGN.md for the consequence of that choice (§9 open question).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::fmt;

use log::warn;

const MAGIC: u32 = 0x5649_5048; // "VIPH"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    String = 0,
    Array = 1,
    Object = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElemKind {
    Byte = 0,
    I32 = 1,
    I64 = 2,
    F64 = 3,
    Str = 4,
    Object = 5,
}

/// The header that precedes every heap payload (§4.B).
#[repr(C)]
pub struct Header {
    magic: u32,
    kind: u8,
    elem_kind: u8,
    elem_size: u16,
    refcnt: Cell<u32>,
    len: Cell<u64>,
    cap: Cell<u64>,
}

/// An opaque handle to a heap payload. Null is a valid, empty value.
pub type PayloadPtr = *mut Header;

fn header_layout() -> Layout {
    Layout::new::<Header>()
}

fn payload_layout(elem_size: usize, cap: usize, elem_align: usize) -> Option<Layout> {
    let align = elem_align.max(std::mem::align_of::<Header>());
    let header = header_layout().align_to(align).ok()?;
    let (extended, _) = header.extend(Layout::from_size_align(elem_size * cap, align).ok()?).ok()?;
    Some(extended.pad_to_align())
}

/// Checks the `magic` tag; a mismatch indicates heap corruption and
/// aborts the process immediately in debug builds (§4.B invariant).
unsafe fn check_magic(p: PayloadPtr) {
    if !p.is_null() {
        let magic = (*p).magic;
        if magic != MAGIC {
            #[cfg(debug_assertions)]
            {
                warn!("viper_heap: corrupted header (magic={:#x}), aborting", magic);
                std::process::abort();
            }
        }
    }
}

/// Allocates a payload with refcnt=1 and a zeroed payload region, with
/// capacity at least `init_len`. Returns null on allocation failure or
/// size overflow (§4.B).
pub fn alloc(kind: PayloadKind, elem_kind: ElemKind, elem_size: usize, init_len: usize, init_cap: usize) -> PayloadPtr {
    alloc_aligned(kind, elem_kind, elem_size, init_len, init_cap, elem_size.max(1))
}

pub fn alloc_aligned(
    kind: PayloadKind,
    elem_kind: ElemKind,
    elem_size: usize,
    init_len: usize,
    init_cap: usize,
    elem_align: usize,
) -> PayloadPtr {
    let cap = init_cap.max(init_len);
    if elem_size.checked_mul(cap).is_none() || cap > (isize::MAX as usize) {
        return std::ptr::null_mut();
    }
    let layout = match payload_layout(elem_size, cap, elem_align) {
        Some(l) => l,
        None => return std::ptr::null_mut(),
    };
    let raw = unsafe { alloc_zeroed(layout) };
    if raw.is_null() {
        return std::ptr::null_mut();
    }
    let header_ptr = raw as *mut Header;
    unsafe {
        header_ptr.write(Header {
            magic: MAGIC,
            kind: kind as u8,
            elem_kind: elem_kind as u8,
            elem_size: elem_size as u16,
            refcnt: Cell::new(1),
            len: Cell::new(init_len as u64),
            cap: Cell::new(cap as u64),
        });
    }
    header_ptr
}

/// Monotonic increment; null-safe.
pub fn retain(p: PayloadPtr) {
    if p.is_null() {
        return;
    }
    unsafe {
        check_magic(p);
        let h = &*p;
        h.refcnt.set(h.refcnt.get() + 1);
    }
}

/// Decrement; on zero, clears the header and frees. Null-safe.
pub fn release(p: PayloadPtr) {
    if p.is_null() {
        return;
    }
    unsafe {
        check_magic(p);
        let h = &*p;
        let count = h.refcnt.get();
        debug_assert!(count > 0, "release of a payload with refcnt already zero");
        h.refcnt.set(count - 1);
        if count <= 1 {
            free_zero_ref(p);
        }
    }
}

/// Decrements without freeing; the caller must run type-specific
/// destructors (e.g. releasing `Str` elements of an array) before
/// calling `free_zero_ref`.
pub fn release_deferred(p: PayloadPtr) {
    if p.is_null() {
        return;
    }
    unsafe {
        check_magic(p);
        let h = &*p;
        let count = h.refcnt.get();
        h.refcnt.set(count.saturating_sub(1));
    }
}

/// Frees a payload whose refcount has reached zero. Poisons the magic
/// tag first so any dangling use is caught by `check_magic`.
pub fn free_zero_ref(p: PayloadPtr) {
    if p.is_null() {
        return;
    }
    unsafe {
        let h_ref = &*p;
        let elem_size = h_ref.elem_size as usize;
        let cap = h_ref.cap.get() as usize;
        let align = elem_size.max(1).max(std::mem::align_of::<Header>());
        let layout = payload_layout(elem_size, cap, align).expect("layout recomputation failed");
        (*p).magic = 0;
        dealloc(p as *mut u8, layout);
    }
}

pub fn len(p: PayloadPtr) -> usize {
    if p.is_null() {
        return 0;
    }
    unsafe {
        check_magic(p);
        (*p).len.get() as usize
    }
}

pub fn cap(p: PayloadPtr) -> usize {
    if p.is_null() {
        return 0;
    }
    unsafe {
        check_magic(p);
        (*p).cap.get() as usize
    }
}

pub fn set_len(p: PayloadPtr, new_len: usize) {
    if p.is_null() {
        return;
    }
    unsafe {
        check_magic(p);
        (*p).len.set(new_len as u64);
    }
}

pub fn elem_kind(p: PayloadPtr) -> Option<ElemKind> {
    if p.is_null() {
        return None;
    }
    unsafe {
        check_magic(p);
        match (*p).elem_kind {
            0 => Some(ElemKind::Byte),
            1 => Some(ElemKind::I32),
            2 => Some(ElemKind::I64),
            3 => Some(ElemKind::F64),
            4 => Some(ElemKind::Str),
            5 => Some(ElemKind::Object),
            _ => None,
        }
    }
}

/// Pointer to the first byte of the payload data region. Null-safe:
/// returns null for a null payload.
pub fn data(p: PayloadPtr) -> *mut u8 {
    if p.is_null() {
        return std::ptr::null_mut();
    }
    unsafe {
        check_magic(p);
        let elem_size = (*p).elem_size as usize;
        let align = elem_size.max(1).max(std::mem::align_of::<Header>());
        let header = header_layout().align_to(align).expect("alignment");
        (p as *mut u8).add(header.pad_to_align().size())
    }
}

/// Grows a payload in place when uniquely owned (`refcnt == 1`),
/// otherwise copy-on-writes into a fresh allocation; newly exposed tail
/// bytes are zeroed either way. Returns the (possibly new) payload.
pub fn grow(p: PayloadPtr, new_len: usize) -> PayloadPtr {
    if p.is_null() {
        return p;
    }
    unsafe {
        check_magic(p);
        let h = &*p;
        let elem_size = h.elem_size as usize;
        let old_cap = h.cap.get() as usize;
        let old_len = h.len.get() as usize;

        if new_len <= old_cap {
            if h.refcnt.get() == 1 {
                if new_len > old_len {
                    let tail = data(p).add(old_len * elem_size);
                    std::ptr::write_bytes(tail, 0, (new_len - old_len) * elem_size);
                }
                set_len(p, new_len);
                return p;
            }
        }
        let new_cap = new_len.max(old_cap.max(1) * 2);
        let kind = match h.kind {
            0 => PayloadKind::String,
            1 => PayloadKind::Array,
            _ => PayloadKind::Object,
        };
        let ek = elem_kind(p).unwrap_or(ElemKind::Byte);
        let fresh = alloc(kind, ek, elem_size, new_len, new_cap);
        if !fresh.is_null() {
            let copy_len = old_len.min(new_len);
            std::ptr::copy_nonoverlapping(data(p), data(fresh), copy_len * elem_size);
        }
        release(p);
        fresh
    }
}

/// A reference-counted string handle. `Clone` retains; `Drop` releases.
pub struct Str(PayloadPtr);

impl Str {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let p = alloc(PayloadKind::String, ElemKind::Byte, 1, bytes.len(), bytes.len());
        if !p.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), data(p), bytes.len());
            }
        }
        Str(p)
    }

    pub fn empty() -> Self {
        Str(std::ptr::null_mut())
    }

    pub fn as_bytes(&self) -> &[u8] {
        if self.0.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(data(self.0), len(self.0)) }
    }

    pub fn len(&self) -> usize {
        len(self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    /// Raw payload pointer, for passing across the runtime ABI boundary.
    pub fn into_raw(self) -> PayloadPtr {
        let p = self.0;
        std::mem::forget(self);
        p
    }

    /// Reconstructs a `Str` from a raw payload pointer without retaining
    /// (the caller transfers ownership of the existing reference).
    ///
    /// # Safety
    /// `p` must be a payload previously produced by `Str::into_raw` (or
    /// null), not yet released.
    pub unsafe fn from_raw(p: PayloadPtr) -> Self {
        Str(p)
    }
}

impl Clone for Str {
    fn clone(&self) -> Self {
        retain(self.0);
        Str(self.0)
    }
}

impl Drop for Str {
    fn drop(&mut self) {
        release(self.0);
    }
}

impl PartialEq for Str {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Str {}

impl fmt::Debug for Str {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Str({:?})", self.as_str())
    }
}

/// A reference-counted, bounds-checked typed array whose elements are
/// plain `Copy` scalars (`i32`, `i64`, `f64`) — no retain/release on
/// store, unlike `StrArray` below.
pub struct RcArray<T: Copy> {
    ptr: PayloadPtr,
    _marker: std::marker::PhantomData<T>,
}

fn elem_kind_of<T>() -> ElemKind {
    match std::mem::size_of::<T>() {
        4 => ElemKind::I32,
        8 => ElemKind::I64,
        _ => ElemKind::Byte,
    }
}

impl<T: Copy> RcArray<T> {
    pub fn new(len: usize) -> Self {
        let p = alloc_aligned(
            PayloadKind::Array,
            elem_kind_of::<T>(),
            std::mem::size_of::<T>(),
            len,
            len,
            std::mem::align_of::<T>(),
        );
        RcArray { ptr: p, _marker: std::marker::PhantomData }
    }

    pub fn len(&self) -> usize {
        len(self.ptr)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slice(&self) -> &[T] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(data(self.ptr) as *const T, self.len()) }
    }

    fn slice_mut(&mut self) -> &mut [T] {
        if self.ptr.is_null() {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(data(self.ptr) as *mut T, self.len()) }
    }

    /// Aborts the process with `index out of bounds (len=N)` on violation
    /// (§4.B) — array bounds checks are a hard invariant, not a
    /// recoverable error, matching the VM's `IdxChk` trap semantics one
    /// layer up.
    pub fn get(&self, i: usize) -> T {
        let n = self.len();
        if i >= n {
            warn!("index out of bounds (len={})", n);
            std::process::abort();
        }
        self.slice()[i]
    }

    pub fn set(&mut self, i: usize, value: T) {
        let n = self.len();
        if i >= n {
            warn!("index out of bounds (len={})", n);
            std::process::abort();
        }
        self.slice_mut()[i] = value;
    }

    pub fn resize(&mut self, new_len: usize) {
        self.ptr = grow(self.ptr, new_len);
    }

    pub fn as_slice(&self) -> &[T] {
        self.slice()
    }
}

impl<T: Copy> Clone for RcArray<T> {
    fn clone(&self) -> Self {
        retain(self.ptr);
        RcArray { ptr: self.ptr, _marker: std::marker::PhantomData }
    }
}

impl<T: Copy> Drop for RcArray<T> {
    fn drop(&mut self) {
        release(self.ptr);
    }
}

/// A typed array of `Str` handles: retains on store, releases on
/// overwrite, and releases every live element when the array itself is
/// dropped (§4.B "string-typed arrays additionally retain...").
pub struct StrArray {
    ptr: PayloadPtr,
}

impl StrArray {
    pub fn new(len: usize) -> Self {
        let p = alloc_aligned(
            PayloadKind::Array,
            ElemKind::Str,
            std::mem::size_of::<PayloadPtr>(),
            len,
            len,
            std::mem::align_of::<PayloadPtr>(),
        );
        StrArray { ptr: p }
    }

    pub fn len(&self) -> usize {
        len(self.ptr)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slots(&self) -> &[Cell<PayloadPtr>] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(data(self.ptr) as *const Cell<PayloadPtr>, self.len()) }
    }

    pub fn get(&self, i: usize) -> Str {
        let n = self.len();
        if i >= n {
            warn!("index out of bounds (len={})", n);
            std::process::abort();
        }
        let raw = self.slots()[i].get();
        retain(raw);
        unsafe { Str::from_raw(raw) }
    }

    pub fn set(&mut self, i: usize, value: Str) {
        let n = self.len();
        if i >= n {
            warn!("index out of bounds (len={})", n);
            std::process::abort();
        }
        let new_raw = value.into_raw();
        let slot = &self.slots()[i];
        let old_raw = slot.get();
        slot.set(new_raw);
        release(old_raw);
    }

    pub fn resize(&mut self, new_len: usize) {
        let old_len = self.len();
        self.ptr = grow(self.ptr, new_len);
        let _ = old_len;
    }
}

impl Clone for StrArray {
    fn clone(&self) -> Self {
        retain(self.ptr);
        StrArray { ptr: self.ptr }
    }
}

impl Drop for StrArray {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        unsafe {
            let h = &*self.ptr;
            if h.refcnt.get() == 1 {
                for slot in self.slots() {
                    release(slot.get());
                }
                release_deferred(self.ptr);
                free_zero_ref(self.ptr);
            } else {
                release(self.ptr);
            }
        }
    }
}

pub type BytesArray = RcArray<u8>;
pub type I32Array = RcArray<i32>;
pub type I64Array = RcArray<i64>;
pub type F64Array = RcArray<f64>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn str_round_trips_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let s = Str::from_bytes(&bytes);
            prop_assert_eq!(s.as_bytes(), bytes.as_slice());
        }

        #[test]
        fn array_resize_preserves_existing_prefix(values in proptest::collection::vec(any::<i64>(), 0..32), grow_by in 0usize..32) {
            let mut arr = I64Array::new(values.len());
            for (i, v) in values.iter().enumerate() {
                arr.set(i, *v);
            }
            arr.resize(values.len() + grow_by);
            prop_assert_eq!(&arr.as_slice()[..values.len()], values.as_slice());
        }
    }

    #[test]
    fn alloc_has_refcnt_one_and_zeroed_payload() {
        let arr: I64Array = I64Array::new(4);
        assert_eq!(arr.len(), 4);
        assert_eq!(arr.as_slice(), &[0, 0, 0, 0]);
    }

    #[test]
    fn retain_release_round_trip_frees_at_zero() {
        let arr: I64Array = I64Array::new(2);
        let cloned = arr.clone();
        drop(arr);
        assert_eq!(cloned.len(), 2);
        drop(cloned);
    }

    #[test]
    fn set_get_roundtrip() {
        let mut arr: I32Array = I32Array::new(3);
        arr.set(1, 42);
        assert_eq!(arr.get(1), 42);
        assert_eq!(arr.get(0), 0);
    }

    #[test]
    fn resize_grows_and_zeroes_tail() {
        let mut arr: I64Array = I64Array::new(2);
        arr.set(0, 1);
        arr.set(1, 2);
        arr.resize(4);
        assert_eq!(arr.as_slice(), &[1, 2, 0, 0]);
    }

    #[test]
    fn resize_copy_on_writes_when_shared() {
        let mut arr: I64Array = I64Array::new(2);
        arr.set(0, 9);
        let shared = arr.clone();
        arr.resize(4);
        assert_eq!(arr.as_slice(), &[9, 0, 0, 0]);
        assert_eq!(shared.as_slice(), &[9, 0]);
    }

    #[test]
    fn str_handle_round_trips_bytes() {
        let s = Str::from_bytes(b"hello");
        assert_eq!(s.as_str(), "hello");
        let cloned = s.clone();
        assert_eq!(s, cloned);
    }

    #[test]
    fn str_array_retains_on_store_and_releases_on_overwrite() {
        let mut arr = StrArray::new(2);
        let a = Str::from_bytes(b"a");
        let b = Str::from_bytes(b"b");
        arr.set(0, a.clone());
        arr.set(0, b); // overwrite releases the retained "a" payload
        assert_eq!(arr.get(0).as_str(), "b");
        assert_eq!(a.as_str(), "a"); // our own handle is still valid
    }

    #[test]
    fn null_payload_accessors_are_safe() {
        assert_eq!(len(std::ptr::null_mut()), 0);
        assert_eq!(cap(std::ptr::null_mut()), 0);
        assert!(data(std::ptr::null_mut()).is_null());
        retain(std::ptr::null_mut());
        release(std::ptr::null_mut());
    }
}
