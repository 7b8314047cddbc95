//! Persistence backends implementing the [`ffrtmp_core::Store`] contract.

pub mod memory;
pub mod postgres;
