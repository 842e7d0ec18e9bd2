pub mod provision;
pub mod school;
