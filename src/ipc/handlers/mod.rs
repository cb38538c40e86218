pub mod config;
pub mod core;
pub mod courses;
pub mod exam_passes;
pub mod payments;
pub mod results;
pub mod sequences;
pub mod students;
