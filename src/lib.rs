//! Duplicate call suppression.
//!
//! A [`Group`] makes sure that, for a given key, only one unit of work is
//! executing at a time. Callers that arrive while it runs wait for it and get
//! the same result instead of starting their own.
//!
//! ```
//! use singleflight::Group;
//!
//! let group: Group<String, u64> = Group::new();
//! let value = group.work("answer", || Ok::<_, std::io::Error>(42))?;
//! assert_eq!(value, 42);
//! assert!(group.is_empty());
//! # Ok::<(), singleflight::Error>(())
//! ```
//!
//! Nothing is cached: once the work returns and the key is released, the
//! next call for that key runs the work again.

mod call;
mod error;
mod group;

pub use error::{Error, Result};
pub use group::Group;
