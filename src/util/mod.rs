//! Utility data structures

pub mod bitvec;
