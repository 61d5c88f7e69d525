pub mod val;
pub mod vm;
