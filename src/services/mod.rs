pub mod error;
pub mod runs;
