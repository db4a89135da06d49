//! Heap objects: strings, tables, prototypes and closures.
//!
//! The first fields of [Str], [Table] and [Closure] are `#[repr(C)]` and read directly by
//! generated code, which is why their offsets are exported as constants.

use indexmap::IndexMap;
use std::{cell::Cell, fmt, mem::offset_of};
use thiserror::Error;

use crate::vm::{
    bc::{BcIns, Pc},
    builtins::FfId,
    value::{GcPtr, Tag, TValue},
};

pub const STR_LEN_OFF: i32 = offset_of!(Str, len) as i32;
pub const TAB_ARRAY_OFF: i32 = offset_of!(Table, array) as i32;
pub const TAB_ASIZE_OFF: i32 = offset_of!(Table, asize) as i32;
pub const TAB_META_OFF: i32 = offset_of!(Table, meta) as i32;
pub const TAB_HSIZE_OFF: i32 = offset_of!(Table, hsize) as i32;
pub const FUNC_PROTO_OFF: i32 = offset_of!(Closure, proto) as i32;

/// An interned, immutable string.
#[repr(C)]
pub struct Str {
    len: u64,
    hash: u64,
    data: Box<str>,
}

impl Str {
    pub(crate) fn new(s: &str, hash: u64) -> Self {
        Str {
            len: s.len() as u64,
            hash,
            data: s.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl fmt::Debug for Str {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.data)
    }
}

/// Errors which can occur when storing to a table.
#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("table index is nil")]
    NilKey,
    #[error("table index is NaN")]
    NaNKey,
}

/// A hashable table key. Numbers are keyed by their bit pattern after normalising `-0.0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TKey {
    Str(usize),
    Num(u64),
    Bool(bool),
    Obj(Tag, usize),
}

impl TKey {
    /// Convert a value into a key. Returns `Err` for `nil` and NaN, which cannot be keys.
    pub fn from_tv(tv: &TValue) -> Result<Self, TableError> {
        match tv.tag() {
            Tag::Nil => Err(TableError::NilKey),
            Tag::Num => {
                let n = f64::from_bits(tv.u);
                if n.is_nan() {
                    Err(TableError::NaNKey)
                } else if n == 0.0 {
                    Ok(TKey::Num(0f64.to_bits()))
                } else {
                    Ok(TKey::Num(n.to_bits()))
                }
            }
            Tag::Str => Ok(TKey::Str(tv.u as usize)),
            Tag::True => Ok(TKey::Bool(true)),
            Tag::False => Ok(TKey::Bool(false)),
            t => Ok(TKey::Obj(t, tv.u as usize)),
        }
    }

    pub fn to_tv(self) -> TValue {
        match self {
            TKey::Str(p) => TValue::from_raw(p as u64, Tag::Str),
            TKey::Num(b) => TValue::from_raw(b, Tag::Num),
            TKey::Bool(b) => TValue::bool(b),
            TKey::Obj(t, p) => TValue::from_raw(p as u64, t),
        }
    }
}

/// If `n` is an integer usable as an array index, return it.
pub fn num_as_index(n: f64) -> Option<u64> {
    if n >= 0.0 && n < (u32::MAX as f64) && n.fract() == 0.0 {
        Some(n as u64)
    } else {
        None
    }
}

/// A table with an array part (indices `0..asize`) and an insertion-ordered hash part.
///
/// Integer keys live in exactly one of the two parts: a key is only appended to the array part if
/// it is not already present in the hash part. Hash values are boxed so that a pointer to a value
/// slot remains valid for as long as the table is alive: keys are never removed, storing `nil`
/// merely overwrites the value.
#[repr(C)]
pub struct Table {
    array: *mut TValue,
    asize: u64,
    meta: *mut Table,
    hsize: u64,
    array_vec: Vec<TValue>,
    hash: IndexMap<TKey, Box<TValue>>,
}

impl Table {
    pub(crate) fn new(asize: usize, hsize: usize) -> Self {
        let mut t = Table {
            array: std::ptr::null_mut(),
            asize: 0,
            meta: std::ptr::null_mut(),
            hsize: 0,
            array_vec: vec![TValue::NIL; asize],
            hash: IndexMap::with_capacity(hsize),
        };
        t.sync();
        t
    }

    /// Update the fields read by generated code after the array or hash part has changed.
    fn sync(&mut self) {
        self.array = self.array_vec.as_mut_ptr();
        self.asize = self.array_vec.len() as u64;
        self.hsize = self.hash.len() as u64;
    }

    pub fn asize(&self) -> usize {
        self.asize as usize
    }

    pub fn hsize(&self) -> usize {
        self.hsize as usize
    }

    pub fn meta(&self) -> Option<GcPtr<Table>> {
        GcPtr::from_raw(self.meta)
    }

    pub fn set_meta(&mut self, mt: Option<GcPtr<Table>>) {
        self.meta = mt.map(|x| x.as_ptr()).unwrap_or(std::ptr::null_mut());
    }

    /// Raw lookup of `key`.
    pub fn get(&self, key: &TValue) -> TValue {
        self.get_slot(key).copied().unwrap_or(TValue::NIL)
    }

    pub fn get_str(&self, key: GcPtr<Str>) -> TValue {
        self.get(&TValue::str(key))
    }

    pub fn get_int(&self, i: u64) -> TValue {
        self.get(&TValue::num(i as f64))
    }

    fn get_slot(&self, key: &TValue) -> Option<&TValue> {
        if let Some(i) = key.as_num().and_then(num_as_index) {
            if i < self.asize {
                return Some(&self.array_vec[i as usize]);
            }
        }
        let k = TKey::from_tv(key).ok()?;
        self.hash.get(&k).map(|x| &**x)
    }

    /// Return a pointer to the slot holding `key`, or `None` if `key` is in neither part. An
    /// array slot pointer is valid until the array part next grows; a hash slot pointer for as
    /// long as the table lives.
    pub(crate) fn slot(&mut self, key: &TValue) -> Option<*mut TValue> {
        if let Some(i) = key.as_num().and_then(num_as_index) {
            if i < self.asize {
                return Some(&mut self.array_vec[i as usize] as *mut TValue);
            }
        }
        let k = TKey::from_tv(key).ok()?;
        self.hash.get_mut(&k).map(|x| &mut **x as *mut TValue)
    }

    /// Return a pointer to the slot for `key`, creating it (with a `nil` value) if it doesn't
    /// exist. The pointer is valid until the array part next grows.
    pub(crate) fn newref(&mut self, key: &TValue) -> Result<*mut TValue, TableError> {
        let k = TKey::from_tv(key)?;
        if let TKey::Num(b) = k {
            if let Some(i) = num_as_index(f64::from_bits(b)) {
                if i < self.asize {
                    return Ok(&mut self.array_vec[i as usize] as *mut TValue);
                }
                if !self.hash.contains_key(&k) && (i == self.asize || (self.asize == 0 && i == 1))
                {
                    if self.asize == 0 && i == 1 {
                        self.array_vec.push(TValue::NIL);
                    }
                    self.array_vec.push(TValue::NIL);
                    self.sync();
                    return Ok(&mut self.array_vec[i as usize] as *mut TValue);
                }
            }
        }
        let p = &mut **self.hash.entry(k).or_insert_with(|| Box::new(TValue::NIL)) as *mut TValue;
        self.sync();
        Ok(p)
    }

    /// Raw store of `val` at `key`.
    pub fn set(&mut self, key: &TValue, val: TValue) -> Result<(), TableError> {
        if let Some(i) = key.as_num().and_then(num_as_index) {
            if i < self.asize {
                self.array_vec[i as usize] = val;
                return Ok(());
            }
        }
        let k = TKey::from_tv(key)?;
        if let Some(x) = self.hash.get_mut(&k) {
            **x = val;
            return Ok(());
        }
        if val.is_nil() {
            return Ok(());
        }
        let p = self.newref(key)?;
        unsafe { *p = val };
        Ok(())
    }

    pub fn set_int(&mut self, i: u64, val: TValue) {
        // Integer keys are never nil or NaN.
        let _ = self.set(&TValue::num(i as f64), val);
    }

    /// The length of the table: a border `n` such that `t[n]` is non-nil and `t[n+1]` is nil (or
    /// zero if `t[1]` is nil).
    pub fn len(&self) -> u64 {
        let asize = self.asize;
        if asize > 1 && self.array_vec[(asize - 1) as usize].is_nil() {
            let (mut lo, mut hi) = (0u64, asize - 1);
            while hi - lo > 1 {
                let m = (lo + hi) / 2;
                if self.array_vec[m as usize].is_nil() {
                    hi = m;
                } else {
                    lo = m;
                }
            }
            return lo;
        }
        let mut n = if asize == 0 { 0 } else { asize - 1 };
        while !self.get_int(n + 1).is_nil() {
            n += 1;
        }
        n
    }

    /// Return the key/value pair following `key` in traversal order: array part first, then the
    /// hash part in insertion order. Returns `Ok(None)` at the end of the traversal.
    pub fn next(&self, key: &TValue) -> Result<Option<(TValue, TValue)>, TableError> {
        let mut i = if key.is_nil() {
            0
        } else if let Some(i) = key.as_num().and_then(num_as_index).filter(|i| *i < self.asize) {
            i + 1
        } else {
            let k = TKey::from_tv(key)?;
            match self.hash.get_index_of(&k) {
                Some(j) => self.asize + j as u64 + 1,
                None => return Ok(None),
            }
        };
        while i < self.asize {
            let v = self.array_vec[i as usize];
            if !v.is_nil() {
                return Ok(Some((TValue::num(i as f64), v)));
            }
            i += 1;
        }
        let mut j = (i - self.asize) as usize;
        while let Some((k, v)) = self.hash.get_index(j) {
            if !v.is_nil() {
                return Ok(Some((k.to_tv(), **v)));
            }
            j += 1;
        }
        Ok(None)
    }
}

/// A garbage-collected constant of a [Proto].
#[derive(Clone, Copy, Debug)]
pub enum KGc {
    Str(GcPtr<Str>),
    Proto(GcPtr<Proto>),
}

/// A function prototype.
pub struct Proto {
    pub name: String,
    pub numparams: u8,
    pub framesize: u8,
    pub is_vararg: bool,
    bc: Box<[Cell<BcIns>]>,
    knum: Box<[f64]>,
    kgc: Box<[KGc]>,
    /// How many closures have been created from this prototype?
    pub(crate) closure_count: Cell<u32>,
    jit_disabled: Cell<bool>,
}

impl Proto {
    pub(crate) fn new(
        name: String,
        numparams: u8,
        framesize: u8,
        is_vararg: bool,
        bc: Vec<BcIns>,
        knum: Vec<f64>,
        kgc: Vec<KGc>,
    ) -> Self {
        Proto {
            name,
            numparams,
            framesize,
            is_vararg,
            bc: bc.into_iter().map(Cell::new).collect(),
            knum: knum.into_boxed_slice(),
            kgc: kgc.into_boxed_slice(),
            closure_count: Cell::new(0),
            jit_disabled: Cell::new(false),
        }
    }

    /// The [Pc] of instruction `i`.
    ///
    /// # Panics
    ///
    /// If `i` is out of bounds.
    pub fn pc_at(&self, i: usize) -> Pc {
        Pc::new(&self.bc[i])
    }

    pub fn bc_len(&self) -> usize {
        self.bc.len()
    }

    /// Does `pc` point into this prototype's bytecode?
    pub fn contains(&self, pc: Pc) -> bool {
        let start = self.pc_at(0).addr();
        let end = start + self.bc.len() * std::mem::size_of::<BcIns>();
        pc.addr() >= start && pc.addr() < end
    }

    /// The index of `pc` within this prototype's bytecode.
    pub fn pc_index(&self, pc: Pc) -> usize {
        pc.diff(self.pc_at(0)) as usize
    }

    pub fn knum(&self, d: u16) -> f64 {
        self.knum[usize::from(d)]
    }

    /// The string constant `d`.
    ///
    /// # Panics
    ///
    /// If constant `d` is not a string.
    pub fn kstr(&self, d: u16) -> GcPtr<Str> {
        match self.kgc[usize::from(d)] {
            KGc::Str(s) => s,
            KGc::Proto(_) => panic!("constant {d} is not a string"),
        }
    }

    pub fn kproto(&self, d: u16) -> Option<GcPtr<Proto>> {
        match self.kgc[usize::from(d)] {
            KGc::Proto(p) => Some(p),
            KGc::Str(_) => None,
        }
    }

    pub fn jit_disabled(&self) -> bool {
        self.jit_disabled.get()
    }

    pub fn set_jit_disabled(&self) {
        self.jit_disabled.set(true);
    }
}

impl fmt::Debug for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<proto {}>", self.name)
    }
}

/// A function value: either a Lua function (`proto` is non-null) or a builtin "fast function".
#[repr(C)]
pub struct Closure {
    proto: *const Proto,
    pub ffid: FfId,
}

impl Closure {
    pub(crate) fn lua(p: GcPtr<Proto>) -> Self {
        Closure {
            proto: p.as_ptr(),
            ffid: FfId::Lua,
        }
    }

    pub(crate) fn fast(ffid: FfId) -> Self {
        Closure {
            proto: std::ptr::null(),
            ffid,
        }
    }

    pub fn proto(&self) -> Option<GcPtr<Proto>> {
        GcPtr::from_raw(self.proto as *mut Proto)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn array_and_hash_parts() {
        let mut t = Table::new(0, 0);
        for i in 1..=4 {
            t.set_int(i, TValue::num(i as f64 * 10.0));
        }
        assert_eq!(t.asize(), 5);
        assert_eq!(t.hsize(), 0);
        assert_eq!(t.len(), 4);
        t.set_int(7, TValue::num(70.0));
        assert_eq!(t.hsize(), 1);
        assert_eq!(t.get_int(7).as_num(), Some(70.0));
        assert_eq!(t.len(), 4);
        assert_eq!(
            t.set(&TValue::NIL, TValue::bool(true)),
            Err(TableError::NilKey)
        );
        assert_eq!(
            t.set(&TValue::num(f64::NAN), TValue::bool(true)),
            Err(TableError::NaNKey)
        );
    }

    #[test]
    fn hash_slots_are_stable() {
        let mut t = Table::new(0, 0);
        let k = TValue::bool(true);
        let p = t.newref(&k).unwrap();
        for i in 0..100 {
            t.set(&TValue::num(1000.0 + i as f64), TValue::num(0.0)).unwrap();
        }
        assert_eq!(t.slot(&k), Some(p));
        let mut a = Table::new(4, 0);
        assert!(a.slot(&TValue::num(3.0)).is_some());
        assert!(a.slot(&TValue::num(9.0)).is_none());
    }

    #[test]
    fn traversal() {
        let mut t = Table::new(3, 0);
        t.set_int(1, TValue::num(1.0));
        t.set(&TValue::bool(false), TValue::num(2.0)).unwrap();
        let (k, _) = t.next(&TValue::NIL).unwrap().unwrap();
        assert_eq!(k.as_num(), Some(1.0));
        let (k, v) = t.next(&k).unwrap().unwrap();
        assert_eq!(k.tag(), Tag::False);
        assert_eq!(v.as_num(), Some(2.0));
        assert!(t.next(&k).unwrap().is_none());
    }
}
