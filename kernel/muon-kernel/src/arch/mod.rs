//! Architecture-specific code.
//!
//! Everything that interprets register-context bits, touches MMIO, or
//! executes privileged instructions lives under here. The scheduling
//! policy above is architecture-neutral and host-testable; on non-bare
//! targets the privileged operations compile to no-ops.

pub mod x86_64;
