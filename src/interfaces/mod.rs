pub mod generator;
pub mod scheduler;
