pub mod checkpoint;
pub mod data;
pub mod design;
pub mod distributions;
pub mod error;
pub mod interrupt;
pub mod model;
pub mod training;
pub mod utils;
