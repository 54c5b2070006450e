//! x86_64 support: execution contexts, privileged instructions, the LAPIC
//! one-shot timer, and the address-space (CR3) capability.

pub mod context;
pub mod instructions;
pub mod lapic;
pub mod paging;
