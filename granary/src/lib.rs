//! `granary` is the shared component library of the granary binary
//! cache proxy. It contains the domain-neutral building blocks used by
//! the server: hashing, content-defined chunking, manifest signing,
//! stream utilities, and validation of the various name formats that
//! appear in the Nix binary cache protocol.

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]

pub mod chunking;
pub mod error;
pub mod hash;
pub mod mime;
pub mod namespace;
pub mod signing;
pub mod store_path;
pub mod stream;
pub mod testing;

pub use error::{GranaryError, GranaryResult};
