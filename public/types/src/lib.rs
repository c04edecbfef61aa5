pub mod bsdata;
pub mod grid;
