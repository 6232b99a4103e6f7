pub mod clock;
pub mod dashmap;
