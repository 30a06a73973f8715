pub mod aggregator;
pub mod due;
pub mod source;
