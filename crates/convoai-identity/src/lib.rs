//! Bearer-token verification for the conversation plane.
//!
//! Tokens are minted by the identity store (out of scope) and verified here
//! against a single process-wide HMAC key. Verification is a pure function —
//! no I/O, no caching.

pub mod token;

pub use token::{Claims, Verifier};
