//! Storage backend implementations.

pub mod linstor;
