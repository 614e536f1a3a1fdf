pub mod complex;

pub use complex::*;
