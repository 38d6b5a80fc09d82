// Cryptographic primitives and key schedule utilities.
// Numan Thabit 2025

pub mod aead;
pub mod keys;
