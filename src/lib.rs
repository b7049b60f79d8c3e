//! SagaFlow Rust
//!
//! Fachada del workspace:
//! - Re-exporta `saga_core` (motor, definiciones, log en memoria).
//! - `demo`: servicio y máquinas de ejemplo usadas por `main-core` y por los
//!   tests end-to-end.

pub mod demo;

pub use saga_core::*;
