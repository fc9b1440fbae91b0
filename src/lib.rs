//! Intrusive, atomically reference-counted values.
//!
//! A type opts in by carrying a [`RefCount`] and implementing [`RefCounted`]
//! (or by being wrapped in a [`Counted`]). [`Ref`] handles then keep that
//! count up to date across clones, moves and drops, and the last one to go
//! frees the value.
//!
//! ```
//! use refcounted::{Counted, Ref};
//!
//! let a = Ref::new(Counted::new(String::from("shared")));
//! let b = a.clone();
//! assert_eq!(Ref::count(&a), 2);
//!
//! drop(b);
//! assert_eq!(Ref::count(&a), 1);
//! assert_eq!(a.as_str(), "shared");
//! ```
#![deny(unsafe_op_in_unsafe_fn)]

pub mod atomic_refcount;
pub mod ref_ptr;

pub use atomic_refcount::{Counted, RefCount, RefCounted, Release};
pub use ref_ptr::Ref;
