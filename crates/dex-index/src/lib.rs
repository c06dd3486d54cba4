//! Index B: a partitioned index client with server-offload and a
//! path-aware cache, modeled on the original prototype's `Dex`.

pub mod index;

pub use index::{init_bucket_owner, Dex};
