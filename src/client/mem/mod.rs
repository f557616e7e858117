mod mem_coordinator;

pub use mem_coordinator::*;
