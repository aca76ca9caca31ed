pub mod analysis;
pub mod context;
pub mod entity;
pub mod error;
pub mod ir;
pub mod jumptable;
pub mod pipeline;
pub mod transforms;

#[cfg(test)]
mod stress_tests;
