//! Functions that generated code calls out to.
//!
//! Traces never allocate or look up hash keys inline: they call the functions here, which use the
//! `extern "C"` ABI. Every function is described by a [CallInfo] so that the assembler knows which
//! registers to pass arguments in and what the result is.

use strum::{Display, FromRepr};

use crate::{
    compile::{effects::Effects, jit_ir::Ty},
    vm::{
        builtins::str_sub,
        heap::Heap,
        obj::{Str, Table},
        value::{GcPtr, Tag, TValue},
    },
};

/// The register class of a call argument or result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ArgClass {
    Gp,
    Fp,
}

/// The call-outs available to [super::jit_ir::Opcode::Call] and to the lowering of table
/// operations.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, FromRepr, PartialEq, Eq, Hash)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum CallId {
    TabHref,
    TabNewRef,
    TabNew,
    TabBarrier,
    TabLen,
    StrConcat,
    StrSub,
    Pow,
}

pub(crate) struct CallInfo {
    pub(crate) addr: usize,
    pub(crate) args: &'static [ArgClass],
    /// Is the first argument the heap? Generated code loads it from the JIT context rather than
    /// taking it from an IR operand.
    pub(crate) heap: bool,
    /// The type of the result, or [Ty::Void].
    pub(crate) ret: Ty,
    /// The memory the call may write to.
    pub(crate) writes: Effects,
    /// The memory the call reads from.
    pub(crate) reads: Effects,
}

use ArgClass::{Fp, Gp};

impl CallId {
    pub(crate) fn info(self) -> CallInfo {
        match self {
            CallId::TabHref => CallInfo {
                addr: uj_tab_href as *const () as usize,
                args: &[Gp, Gp, Gp, Gp],
                heap: true,
                ret: Ty::Ptr,
                writes: Effects::none(),
                reads: Effects::none().add_hash().add_field(),
            },
            CallId::TabNewRef => CallInfo {
                addr: uj_tab_newref as *const () as usize,
                args: &[Gp, Gp, Gp],
                heap: false,
                ret: Ty::Ptr,
                writes: Effects::all(),
                reads: Effects::all(),
            },
            CallId::TabNew => CallInfo {
                addr: uj_tab_new as *const () as usize,
                args: &[Gp, Gp, Gp],
                heap: true,
                ret: Ty::Tab,
                writes: Effects::none(),
                reads: Effects::none(),
            },
            CallId::TabBarrier => CallInfo {
                addr: uj_tab_barrier as *const () as usize,
                args: &[Gp, Gp],
                heap: true,
                ret: Ty::Void,
                writes: Effects::none(),
                reads: Effects::none(),
            },
            CallId::TabLen => CallInfo {
                addr: uj_tab_len as *const () as usize,
                args: &[Gp],
                heap: false,
                ret: Ty::Num,
                writes: Effects::none(),
                reads: Effects::all(),
            },
            CallId::StrConcat => CallInfo {
                addr: uj_str_concat as *const () as usize,
                args: &[Gp, Gp, Gp],
                heap: true,
                ret: Ty::Str,
                writes: Effects::none(),
                reads: Effects::none(),
            },
            CallId::StrSub => CallInfo {
                addr: uj_str_sub as *const () as usize,
                args: &[Gp, Gp, Fp, Fp],
                heap: true,
                ret: Ty::Str,
                writes: Effects::none(),
                reads: Effects::none(),
            },
            CallId::Pow => CallInfo {
                addr: uj_pow as *const () as usize,
                args: &[Fp, Fp],
                heap: false,
                ret: Ty::Num,
                writes: Effects::none(),
                reads: Effects::none(),
            },
        }
    }

    /// Can a call be removed if its result is unused, and be CSEd with an identical call?
    pub(crate) fn is_pure(self) -> bool {
        let ci = self.info();
        ci.writes.is_none() && !matches!(self, CallId::TabNew | CallId::TabBarrier)
    }
}

fn key_of(u: u64, tag: u64) -> TValue {
    TValue { u, tag }
}

/// Return a pointer to the slot of key `(u, tag)` in `t`, in either part of the table, or the
/// heap's `niltv` if there is no such slot.
extern "C" fn uj_tab_href(heap: *const Heap, t: *mut Table, u: u64, tag: u64) -> *const TValue {
    let heap = unsafe { &*heap };
    let t = unsafe { &mut *t };
    match t.slot(&key_of(u, tag)) {
        Some(p) => p,
        None => heap.niltv(),
    }
}

/// Return a pointer to the (possibly new) slot of key `(u, tag)` in `t`. The recorder guarantees
/// that the key is neither nil nor NaN.
extern "C" fn uj_tab_newref(t: *mut Table, u: u64, tag: u64) -> *mut TValue {
    let t = unsafe { &mut *t };
    match t.newref(&key_of(u, tag)) {
        Ok(p) => p,
        Err(e) => panic!("newref with invalid key: {e}"),
    }
}

extern "C" fn uj_tab_new(heap: *mut Heap, asize: u64, hsize: u64) -> *mut Table {
    let heap = unsafe { &mut *heap };
    heap.new_table(asize as usize, hsize as usize).as_ptr()
}

extern "C" fn uj_tab_barrier(heap: *const Heap, t: *mut Table) {
    let heap = unsafe { &*heap };
    if let Some(t) = GcPtr::from_raw(t) {
        heap.barrier(t);
    }
}

extern "C" fn uj_tab_len(t: *mut Table) -> f64 {
    unsafe { &*t }.len() as f64
}

extern "C" fn uj_str_concat(heap: *mut Heap, a: *mut Str, b: *mut Str) -> *mut Str {
    let heap = unsafe { &mut *heap };
    match (GcPtr::from_raw(a), GcPtr::from_raw(b)) {
        (Some(a), Some(b)) => heap.concat(a, b).as_ptr(),
        _ => panic!("concatenation of a null string"),
    }
}

extern "C" fn uj_str_sub(heap: *mut Heap, s: *mut Str, i: f64, j: f64) -> *mut Str {
    let heap = unsafe { &mut *heap };
    match GcPtr::from_raw(s) {
        Some(s) => str_sub(heap, s, i, j).as_ptr(),
        None => panic!("string.sub of a null string"),
    }
}

extern "C" fn uj_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

/// The tag to pass alongside a key of type `ty`.
pub(crate) fn key_tag(ty: Ty) -> u64 {
    ty.tag().unwrap_or(Tag::Nil) as u64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn href_and_newref() {
        let mut heap = Heap::new();
        let t = heap.new_table(0, 0);
        let k = TValue::bool(true);
        let miss = uj_tab_href(&heap, t.as_ptr(), k.u, k.tag);
        assert_eq!(miss, heap.niltv());
        let p = uj_tab_newref(t.as_ptr(), k.u, k.tag);
        unsafe { *p = TValue::num(3.0) };
        let hit = uj_tab_href(&heap, t.as_ptr(), k.u, k.tag);
        assert_eq!(hit, p as *const TValue);
        assert_eq!(t.get(&k).as_num(), Some(3.0));
        // Array-range keys are found too.
        let t = heap.new_table(4, 0);
        let k = TValue::num(2.0);
        let p = uj_tab_href(&heap, t.as_ptr(), k.u, k.tag);
        assert_ne!(p, heap.niltv());
        assert!(CallId::TabHref.info().heap);
        assert!(!CallId::TabNewRef.info().heap);
    }

    #[test]
    fn purity() {
        assert!(CallId::Pow.is_pure());
        assert!(CallId::TabHref.is_pure());
        assert!(!CallId::TabNewRef.is_pure());
        assert!(!CallId::TabNew.is_pure());
        assert_eq!(CallId::from_repr(CallId::StrSub as u8), Some(CallId::StrSub));
        assert_eq!(uj_pow(2.0, 10.0), 1024.0);
    }

    #[test]
    fn call_addresses() {
        let addrs = (0u8..)
            .map_while(CallId::from_repr)
            .map(|c| c.info().addr)
            .collect::<Vec<_>>();
        assert_eq!(addrs.len(), 8);
        for (i, a) in addrs.iter().enumerate() {
            assert!(!addrs[..i].contains(a));
        }
        let pow: extern "C" fn(f64, f64) -> f64 =
            unsafe { std::mem::transmute(CallId::Pow.info().addr as *const ()) };
        assert_eq!(pow(3.0, 2.0), 9.0);
    }
}
