//! Anonymous pipes — component B of the core.

pub mod pipe;
