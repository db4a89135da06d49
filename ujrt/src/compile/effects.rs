//! Specify and query the memory effects of IR instructions.
//!
//! Effects form a simple lattice:
//!
//! ```text
//!              All
//!               |
//!      _________|_________
//!     /         |         \
//!  Array      Hash      Field
//!     \_________|_________/
//!               |
//!             None
//! ```
//!
//! `Array` is the contents of tables' array parts; `Hash` the contents of hash parts; and `Field`
//! the header fields of tables (array pointer and size, hash size, metatable). Two [Effects]
//! interfere if they share an element: a load may not be moved across, or forwarded from beyond,
//! a store whose write effects interfere with the load's read effects.

pub const EFFECT_ARRAY: u8 = 0b0001;
pub const EFFECT_HASH: u8 = 0b0010;
pub const EFFECT_FIELD: u8 = 0b0100;

/// The number of distinct effect bits.
pub(crate) const EFFECT_BITS: usize = 3;

/// A set of effects. This is an immutable struct: new [Effects] are created with the various
/// builder-style methods herein.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Effects(u8);

#[allow(unused)]
impl Effects {
    /// An effects instance that interferes with everything.
    pub const fn all() -> Self {
        Self(EFFECT_ARRAY | EFFECT_HASH | EFFECT_FIELD)
    }

    /// An effects instance that interferes with nothing.
    pub const fn none() -> Self {
        Self(0)
    }

    pub const fn add_array(self) -> Self {
        Self(self.0 | EFFECT_ARRAY)
    }

    pub const fn add_hash(self) -> Self {
        Self(self.0 | EFFECT_HASH)
    }

    pub const fn add_field(self) -> Self {
        Self(self.0 | EFFECT_FIELD)
    }

    pub const fn minus_array(self) -> Self {
        Self(self.0 & !EFFECT_ARRAY)
    }

    pub const fn minus_hash(self) -> Self {
        Self(self.0 & !EFFECT_HASH)
    }

    pub const fn minus_field(self) -> Self {
        Self(self.0 & !EFFECT_FIELD)
    }

    /// Create a new `Effects` with the union of `self` and `other`.
    pub const fn union(self, other: Effects) -> Self {
        Self(self.0 | other.0)
    }

    /// Do `self` and `other` interfere with each other?
    pub const fn interferes(&self, other: Effects) -> bool {
        (self.0 & other.0) != 0
    }

    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Iterate over the indexes (`0..EFFECT_BITS`) of the elements in this set.
    pub fn bits(self) -> impl Iterator<Item = usize> {
        (0..EFFECT_BITS).filter(move |i| self.0 & (1 << i) != 0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interferes() {
        assert!(Effects::all().interferes(Effects::all()));
        assert!(Effects::all().interferes(Effects::none().add_hash()));
        assert!(!Effects::all().interferes(Effects::none()));
        assert!(!Effects::none().interferes(Effects::all()));
        assert!(!Effects::none()
            .add_array()
            .interferes(Effects::none().add_hash().add_field()));
        assert!(!Effects::all()
            .minus_array()
            .interferes(Effects::none().add_array()));
    }

    #[test]
    fn bits() {
        assert_eq!(Effects::all().bits().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(
            Effects::none().add_field().bits().collect::<Vec<_>>(),
            vec![2]
        );
        assert!(Effects::all().minus_array().minus_hash().minus_field().is_none());
    }
}
