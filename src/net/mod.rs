//! Local stream sockets built on top of two pipes — component E.

pub mod socket;
