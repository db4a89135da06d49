//! The object heap.
//!
//! This heap never collects: every object lives until the heap is dropped. It does however keep
//! the bookkeeping a collector would need from the JIT, namely write barriers and the set of
//! objects referenced by compiled code, so that both can be observed.

use std::{cell::Cell, collections::HashMap};

use crate::vm::{
    builtins::FfId,
    obj::{Closure, Proto, Str, Table},
    value::{GcPtr, TValue},
};

pub struct Heap {
    strs: HashMap<Box<str>, GcPtr<Str>>,
    str_objs: Vec<Box<Str>>,
    tables: Vec<Box<Table>>,
    closures: Vec<Box<Closure>>,
    protos: Vec<Box<Proto>>,
    /// Objects referenced by compiled traces, with a reference count.
    roots: HashMap<usize, usize>,
    barriers: Cell<u64>,
    /// The value returned when a hash lookup misses. Generated code compares lookup results
    /// against this address.
    niltv: Box<TValue>,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            strs: HashMap::new(),
            str_objs: Vec::new(),
            tables: Vec::new(),
            closures: Vec::new(),
            protos: Vec::new(),
            roots: HashMap::new(),
            barriers: Cell::new(0),
            niltv: Box::new(TValue::NIL),
        }
    }

    /// Return the unique string object for `s`.
    pub fn intern(&mut self, s: &str) -> GcPtr<Str> {
        if let Some(x) = self.strs.get(s) {
            return *x;
        }
        // FNV-1a.
        let hash = s.bytes().fold(0xcbf29ce484222325u64, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x100000001b3)
        });
        let mut b = Box::new(Str::new(s, hash));
        let p = GcPtr::from_raw(&mut *b as *mut Str).unwrap();
        self.str_objs.push(b);
        self.strs.insert(s.into(), p);
        p
    }

    pub fn new_table(&mut self, asize: usize, hsize: usize) -> GcPtr<Table> {
        let mut b = Box::new(Table::new(asize, hsize));
        let p = GcPtr::from_raw(&mut *b as *mut Table).unwrap();
        self.tables.push(b);
        p
    }

    pub fn new_proto(&mut self, proto: Proto) -> GcPtr<Proto> {
        let mut b = Box::new(proto);
        let p = GcPtr::from_raw(&mut *b as *mut Proto).unwrap();
        self.protos.push(b);
        p
    }

    /// Create a new closure of `proto`.
    pub fn new_closure(&mut self, proto: GcPtr<Proto>) -> GcPtr<Closure> {
        proto.closure_count.set(proto.closure_count.get() + 1);
        self.push_closure(Closure::lua(proto))
    }

    pub fn new_fast(&mut self, ffid: FfId) -> GcPtr<Closure> {
        self.push_closure(Closure::fast(ffid))
    }

    fn push_closure(&mut self, c: Closure) -> GcPtr<Closure> {
        let mut b = Box::new(c);
        let p = GcPtr::from_raw(&mut *b as *mut Closure).unwrap();
        self.closures.push(b);
        p
    }

    pub fn concat(&mut self, a: GcPtr<Str>, b: GcPtr<Str>) -> GcPtr<Str> {
        let s = format!("{}{}", a.as_str(), b.as_str());
        self.intern(&s)
    }

    /// The write barrier, called after a reference is stored into `t`.
    pub fn barrier(&self, _t: GcPtr<Table>) {
        self.barriers.set(self.barriers.get() + 1);
    }

    /// How many write barriers have been executed so far?
    pub fn barrier_count(&self) -> u64 {
        self.barriers.get()
    }

    pub fn niltv(&self) -> *const TValue {
        &*self.niltv
    }

    /// Register `addr` as a root: it will not be freed until a matching [Self::remove_root].
    pub fn add_root(&mut self, addr: usize) {
        *self.roots.entry(addr).or_insert(0) += 1;
    }

    pub fn remove_root(&mut self, addr: usize) {
        if let Some(c) = self.roots.get_mut(&addr) {
            *c -= 1;
            if *c == 0 {
                self.roots.remove(&addr);
            }
        }
    }

    pub fn is_root(&self, addr: usize) -> bool {
        self.roots.contains_key(&addr)
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interning() {
        let mut h = Heap::new();
        let a = h.intern("abc");
        let b = h.intern("abc");
        assert_eq!(a, b);
        assert_ne!(a, h.intern("abd"));
        assert_eq!(h.concat(a, b).as_str(), "abcabc");
    }

    #[test]
    fn roots() {
        let mut h = Heap::new();
        h.add_root(8);
        h.add_root(8);
        h.remove_root(8);
        assert!(h.is_root(8));
        h.remove_root(8);
        assert!(!h.is_root(8));
    }
}
