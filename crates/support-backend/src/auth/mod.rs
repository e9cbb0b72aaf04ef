//! End-user authentication is assumed upstream; `JwtManager` is kept so a
//! deployment that terminates its own bearer tokens in front of this crate
//! still has somewhere to mint/validate them, and so `JWT_SECRET` is a
//! recognized config key end to end.

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager};
