//! Tagged values as they live in VM stack slots, table slots and trace snapshots.
//!
//! A [TValue] is exactly 16 bytes: an 8 byte payload followed by an 8 byte tag. Generated code
//! relies on this layout (it type checks a slot with a single `cmp qword [slot+8], tag`), so it
//! must not change without changing the assembler too.

use std::{fmt, ptr::NonNull};
use strum::FromRepr;

use crate::vm::{
    bc::Pc,
    obj::{Closure, Str, Table},
};

/// The type tag of a [TValue].
#[repr(u64)]
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    Nil = 0,
    False = 1,
    True = 2,
    Num = 3,
    Str = 4,
    Tab = 5,
    Func = 6,
    /// A frame link to a Lua caller. The payload is the return [Pc].
    FrameLua = 7,
    /// A frame link for a vararg frame. The payload is the distance, in slots, to the base of the
    /// frame holding the varargs.
    FrameVarg = 8,
    /// The frame link of the outermost frame, which returns to the host.
    FrameC = 9,
}

impl Tag {
    /// The name a script sees for values with this tag.
    pub fn type_name(self) -> &'static str {
        match self {
            Tag::Nil => "nil",
            Tag::False | Tag::True => "boolean",
            Tag::Num => "number",
            Tag::Str => "string",
            Tag::Tab => "table",
            Tag::Func => "function",
            Tag::FrameLua | Tag::FrameVarg | Tag::FrameC => "frame",
        }
    }

    pub fn is_frame(self) -> bool {
        matches!(self, Tag::FrameLua | Tag::FrameVarg | Tag::FrameC)
    }
}

/// A pointer to an object owned by the [super::heap::Heap]. Objects are never moved or freed
/// while the heap is alive, so a `GcPtr` stays valid for the lifetime of the VM.
#[repr(transparent)]
pub struct GcPtr<T>(NonNull<T>);

impl<T> GcPtr<T> {
    pub(crate) fn from_raw(p: *mut T) -> Option<Self> {
        NonNull::new(p).map(GcPtr)
    }

    pub fn as_ptr(self) -> *mut T {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Obtain a mutable reference to the object.
    ///
    /// The VM is single threaded and no reference into a heap object is ever held across a call
    /// that can observe the same object, which is what makes this sound in practice.
    #[allow(clippy::mut_from_ref)]
    pub fn as_mut(&self) -> &mut T {
        unsafe { &mut *self.0.as_ptr() }
    }
}

impl<T> Clone for GcPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GcPtr<T> {}

impl<T> PartialEq for GcPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for GcPtr<T> {}

impl<T> std::hash::Hash for GcPtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl<T> std::ops::Deref for GcPtr<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.0.as_ref() }
    }
}

impl<T> fmt::Debug for GcPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// A tagged value.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TValue {
    pub u: u64,
    pub tag: u64,
}

static_assertions::assert_eq_size!(TValue, [u64; 2]);

impl TValue {
    pub const NIL: TValue = TValue {
        u: 0,
        tag: Tag::Nil as u64,
    };

    pub fn from_raw(u: u64, tag: Tag) -> Self {
        TValue { u, tag: tag as u64 }
    }

    pub fn bool(b: bool) -> Self {
        TValue::from_raw(0, if b { Tag::True } else { Tag::False })
    }

    pub fn num(n: f64) -> Self {
        TValue::from_raw(n.to_bits(), Tag::Num)
    }

    pub fn str(s: GcPtr<Str>) -> Self {
        TValue::from_raw(s.addr() as u64, Tag::Str)
    }

    pub fn tab(t: GcPtr<Table>) -> Self {
        TValue::from_raw(t.addr() as u64, Tag::Tab)
    }

    pub fn func(f: GcPtr<Closure>) -> Self {
        TValue::from_raw(f.addr() as u64, Tag::Func)
    }

    pub fn link_lua(pc: Pc) -> Self {
        TValue::from_raw(pc.addr() as u64, Tag::FrameLua)
    }

    pub fn link_varg(delta: usize) -> Self {
        TValue::from_raw(delta as u64, Tag::FrameVarg)
    }

    pub fn link_c() -> Self {
        TValue::from_raw(0, Tag::FrameC)
    }

    /// Return this value's tag.
    ///
    /// # Panics
    ///
    /// If the tag word has been corrupted.
    pub fn tag(&self) -> Tag {
        Tag::from_repr(self.tag).unwrap_or_else(|| panic!("corrupt tag {:#x}", self.tag))
    }

    pub fn is_nil(&self) -> bool {
        self.tag == Tag::Nil as u64
    }

    pub fn is_num(&self) -> bool {
        self.tag == Tag::Num as u64
    }

    pub fn is_str(&self) -> bool {
        self.tag == Tag::Str as u64
    }

    pub fn is_tab(&self) -> bool {
        self.tag == Tag::Tab as u64
    }

    pub fn is_func(&self) -> bool {
        self.tag == Tag::Func as u64
    }

    /// Is this value considered true in a condition? Only `nil` and `false` are not.
    pub fn is_truthy(&self) -> bool {
        !matches!(self.tag(), Tag::Nil | Tag::False)
    }

    pub fn as_num(&self) -> Option<f64> {
        self.is_num().then(|| f64::from_bits(self.u))
    }

    pub fn as_str(&self) -> Option<GcPtr<Str>> {
        if self.is_str() {
            GcPtr::from_raw(self.u as *mut Str)
        } else {
            None
        }
    }

    pub fn as_tab(&self) -> Option<GcPtr<Table>> {
        if self.is_tab() {
            GcPtr::from_raw(self.u as *mut Table)
        } else {
            None
        }
    }

    pub fn as_func(&self) -> Option<GcPtr<Closure>> {
        if self.is_func() {
            GcPtr::from_raw(self.u as *mut Closure)
        } else {
            None
        }
    }

    /// If this is a Lua frame link, return the [Pc] execution returns to.
    pub fn as_link_lua(&self) -> Option<Pc> {
        (self.tag == Tag::FrameLua as u64)
            .then(|| Pc::from_addr(self.u as usize))
            .flatten()
    }

    /// Raw equality, i.e. equality without metamethods.
    pub fn raw_eq(&self, other: &TValue) -> bool {
        match (self.as_num(), other.as_num()) {
            (Some(x), Some(y)) => x == y,
            _ => match self.tag() {
                Tag::Nil | Tag::False | Tag::True => self.tag == other.tag,
                _ => self == other,
            },
        }
    }
}

impl Default for TValue {
    fn default() -> Self {
        TValue::NIL
    }
}

impl fmt::Debug for TValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Tag::from_repr(self.tag) {
            Some(Tag::Nil) => write!(f, "nil"),
            Some(Tag::False) => write!(f, "false"),
            Some(Tag::True) => write!(f, "true"),
            Some(Tag::Num) => write!(f, "{}", f64::from_bits(self.u)),
            Some(Tag::Str) => match self.as_str() {
                Some(s) => write!(f, "{:?}", s.as_str()),
                None => write!(f, "<bad string>"),
            },
            Some(t) => write!(f, "{}: {:#x}", t.type_name(), self.u),
            None => write!(f, "<tag {:#x}>: {:#x}", self.tag, self.u),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!TValue::NIL.is_truthy());
        assert!(!TValue::bool(false).is_truthy());
        assert!(TValue::bool(true).is_truthy());
        assert!(TValue::num(0.0).is_truthy());
    }

    #[test]
    fn raw_eq_numbers() {
        assert!(TValue::num(0.0).raw_eq(&TValue::num(-0.0)));
        assert!(!TValue::num(f64::NAN).raw_eq(&TValue::num(f64::NAN)));
        assert!(!TValue::num(1.0).raw_eq(&TValue::bool(true)));
        assert!(TValue::NIL.raw_eq(&TValue::NIL));
    }
}
