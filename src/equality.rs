//! Change detection between two state snapshots.
//!
//! Two layers:
//!
//! - [`Identity`] answers "are these the same value?" under the
//!   identity-with-NaN-equality rule: every NaN is identical to every other
//!   NaN, `+0.0` and `-0.0` are distinct, shared pointers (`Arc`, `Rc`)
//!   compare by address and everything else compares by value.
//! - [`Shallow`] answers "did the state change?" between a previous and a
//!   next snapshot. Structured snapshots are compared one level deep,
//!   driven by the keys of the *next* snapshot only: a key present only in
//!   the previous snapshot is never examined.
//!
//! [`selection_changed`] is the variant used to gate selector-based
//! re-renders: a selection that appears or disappears is always a change.
//!
//! Records opt in with [`shallow_record!`](crate::shallow_record), user
//! value types that should compare as opaque scalars with
//! [`identity_by_eq!`](crate::identity_by_eq).

use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;

/// Sameness of two values under the identity-with-NaN-equality rule.
pub trait Identity {
    /// Returns true if `self` and `other` are the same value.
    fn is_identical(&self, other: &Self) -> bool;
}

/// Shallow change detection between two snapshots of the same state.
///
/// `self` is always the *next* snapshot. Implementations compare one level
/// deep and only look at the entries `self` has.
pub trait Shallow {
    /// Returns true if `self` differs from `prev` one level deep.
    fn changed_from(&self, prev: &Self) -> bool;

    /// True when this value stands for "nothing selected".
    ///
    /// Only `Option::None` is absent. Used by [`selection_changed`].
    fn is_absent(&self) -> bool {
        false
    }
}

/// Whether a selected slice changed between two snapshots.
///
/// A transition between absent and present always counts as a change, even
/// when the shallow comparison alone would say otherwise.
pub fn selection_changed<S: Shallow + ?Sized>(prev: &S, next: &S) -> bool {
    if prev.is_absent() != next.is_absent() {
        cov_mark::hit!(selection_presence_flipped);
        return true;
    }
    next.changed_from(prev)
}

/// Implements [`Identity`] and [`Shallow`] for types that compare as opaque
/// scalars through `PartialEq`.
///
/// ```ignore
/// #[derive(Clone, PartialEq)]
/// enum Filter { All, Active, Done }
/// bindstate::identity_by_eq!(Filter);
/// ```
#[macro_export]
macro_rules! identity_by_eq {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::Identity for $ty {
                #[inline]
                fn is_identical(&self, other: &Self) -> bool {
                    self == other
                }
            }

            impl $crate::Shallow for $ty {
                #[inline]
                fn changed_from(&self, prev: &Self) -> bool {
                    !$crate::Identity::is_identical(self, prev)
                }
            }
        )+
    };
}

/// Implements [`Shallow`] and [`Identity`] for a record by comparing each
/// listed field under [`Identity`].
///
/// Fields that are not listed are ignored by change detection.
///
/// ```ignore
/// #[derive(Clone)]
/// struct Todo { title: String, done: bool }
/// bindstate::shallow_record!(Todo { title, done });
/// ```
#[macro_export]
macro_rules! shallow_record {
    ($ty:ty { $($field:ident),+ $(,)? }) => {
        impl $crate::Identity for $ty {
            fn is_identical(&self, other: &Self) -> bool {
                true $(&& $crate::Identity::is_identical(&self.$field, &other.$field))+
            }
        }

        impl $crate::Shallow for $ty {
            fn changed_from(&self, prev: &Self) -> bool {
                !$crate::Identity::is_identical(self, prev)
            }
        }
    };
}

identity_by_eq!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    String,
    &'static str,
    std::time::Duration,
);

macro_rules! float_identity {
    ($($ty:ty),+) => {
        $(
            impl Identity for $ty {
                #[inline]
                fn is_identical(&self, other: &Self) -> bool {
                    (self.is_nan() && other.is_nan()) || self.to_bits() == other.to_bits()
                }
            }

            impl Shallow for $ty {
                #[inline]
                fn changed_from(&self, prev: &Self) -> bool {
                    !self.is_identical(prev)
                }
            }
        )+
    };
}

float_identity!(f32, f64);

impl Identity for str {
    fn is_identical(&self, other: &Self) -> bool {
        self == other
    }
}

impl<T: ?Sized> Identity for Arc<T> {
    fn is_identical(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

impl<T: ?Sized> Identity for Rc<T> {
    fn is_identical(&self, other: &Self) -> bool {
        Rc::ptr_eq(self, other)
    }
}

impl<T: Identity> Identity for Option<T> {
    fn is_identical(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.is_identical(b),
            _ => false,
        }
    }
}

impl<T: Identity + ?Sized> Identity for Box<T> {
    fn is_identical(&self, other: &Self) -> bool {
        (**self).is_identical(&**other)
    }
}

// Owned sequences have no address to compare, so identity means element-wise
// identity. Shallow comparison of a sequence *snapshot* is index-driven below.
impl<T: Identity> Identity for Vec<T> {
    fn is_identical(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other).all(|(a, b)| a.is_identical(b))
    }
}

impl<T: Shallow> Shallow for Option<T> {
    fn changed_from(&self, prev: &Self) -> bool {
        match (self, prev) {
            (None, None) => false,
            (Some(next), Some(prev)) => next.changed_from(prev),
            _ => true,
        }
    }

    fn is_absent(&self) -> bool {
        self.is_none()
    }
}

impl<T: Shallow + ?Sized> Shallow for Arc<T> {
    fn changed_from(&self, prev: &Self) -> bool {
        !Arc::ptr_eq(self, prev) && (**self).changed_from(&**prev)
    }
}

impl<T: Shallow + ?Sized> Shallow for Rc<T> {
    fn changed_from(&self, prev: &Self) -> bool {
        !Rc::ptr_eq(self, prev) && (**self).changed_from(&**prev)
    }
}

impl<T: Shallow + ?Sized> Shallow for Box<T> {
    fn changed_from(&self, prev: &Self) -> bool {
        (**self).changed_from(&**prev)
    }
}

impl<T: Identity> Shallow for [T] {
    fn changed_from(&self, prev: &Self) -> bool {
        self.iter()
            .enumerate()
            .any(|(i, next)| prev.get(i).is_none_or(|prev| !next.is_identical(prev)))
    }
}

impl<T: Identity> Shallow for Vec<T> {
    fn changed_from(&self, prev: &Self) -> bool {
        self.as_slice().changed_from(prev.as_slice())
    }
}

impl<T: Identity, const N: usize> Shallow for [T; N] {
    fn changed_from(&self, prev: &Self) -> bool {
        self.as_slice().changed_from(prev.as_slice())
    }
}

impl<K, V, S> Shallow for HashMap<K, V, S>
where
    K: Eq + Hash,
    V: Identity,
    S: BuildHasher,
{
    fn changed_from(&self, prev: &Self) -> bool {
        self.iter()
            .any(|(key, next)| prev.get(key).is_none_or(|prev| !next.is_identical(prev)))
    }
}

impl<K, V, S> Shallow for IndexMap<K, V, S>
where
    K: Eq + Hash,
    V: Identity,
    S: BuildHasher,
{
    fn changed_from(&self, prev: &Self) -> bool {
        self.iter()
            .any(|(key, next)| prev.get(key).is_none_or(|prev| !next.is_identical(prev)))
    }
}

impl<K: Ord, V: Identity> Shallow for BTreeMap<K, V> {
    fn changed_from(&self, prev: &Self) -> bool {
        self.iter()
            .any(|(key, next)| prev.get(key).is_none_or(|prev| !next.is_identical(prev)))
    }
}

macro_rules! tuple_shallow {
    ($(($($name:ident . $idx:tt),+)),+ $(,)?) => {
        $(
            impl<$($name: Identity),+> Identity for ($($name,)+) {
                fn is_identical(&self, other: &Self) -> bool {
                    true $(&& self.$idx.is_identical(&other.$idx))+
                }
            }

            impl<$($name: Identity),+> Shallow for ($($name,)+) {
                fn changed_from(&self, prev: &Self) -> bool {
                    !self.is_identical(prev)
                }
            }
        )+
    };
}

tuple_shallow!(
    (A.0),
    (A.0, B.1),
    (A.0, B.1, C.2),
    (A.0, B.1, C.2, D.3),
    (A.0, B.1, C.2, D.3, E.4),
    (A.0, B.1, C.2, D.3, E.4, F.5),
);
