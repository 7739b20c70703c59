//! Library side of the `htree` binary: repository handling shared by the
//! commands and their tests.

pub mod keys;
pub mod repo;

pub use keys::{load_or_create_keys_at, parse_secret};
pub use repo::{DynStore, Repo};
