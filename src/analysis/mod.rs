pub mod aggregator;
pub mod assembler;
