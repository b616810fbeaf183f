//! # Architecture Abstraction Layer
//!
//! The hardware half of the kernel. Everything here implements or drives
//! [`crate::port::Port`]; the kernel logic itself never touches a register.

pub mod cortex_m4;
