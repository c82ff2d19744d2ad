//! Pure-logic utility and codec layer for the load balancer: address/CIDR
//! types, weight math, and a software-reference packet pipeline used as a
//! test oracle for the kernel programs in `fluxlb-ebpf-xdp`/`fluxlb-ebpf-tc`.
//!
//! This crate does no I/O and never touches a BPF map; everything here is
//! plain, host-testable Rust built on top of the byte layouts in
//! `fluxlb-ebpf-common`.

pub mod error;
pub mod net;
pub mod pipeline;
pub mod weight;

pub use error::{CoreError, Result};
pub use net::{addr_from_ip, addr_to_ip, Cidr};
