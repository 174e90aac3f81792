//! Fractional-index key space for ordering blocks.
//!
//! Order keys are base-62 strings compared byte-wise. A new key can always be
//! minted between any two distinct keys, so inserting or moving one block
//! never renumbers its neighbours. Repeated inserts at the same spot grow keys
//! by one symbol per level; [`spaced_keys_after`] produces short, evenly
//! spaced replacements when a collection needs renumbering.
//!
//! ```
//! use quire_keys::{initial_key, key_after, key_between};
//!
//! let a = initial_key();
//! let c = key_after(&a).unwrap();
//! let b = key_between(&a, &c).unwrap();
//! assert!(a < b && b < c);
//! ```

mod error;
mod keyspace;

pub use error::KeyError;
pub use keyspace::{
    average_len, initial_key, is_valid_key, key_after, key_before, key_between,
    spaced_keys_after, validate_key, BASE62,
};
