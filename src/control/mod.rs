//! The balance pipeline: body PID → force allocation QP → torque mapping.

pub mod allocator;
pub mod pid;
pub mod qp;
pub mod torque_mapper;
