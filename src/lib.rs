#![doc = include_str!("../README.md")]

mod error;
mod nonfinite;

pub mod calibration;
pub mod composite;
pub mod expr;
pub mod falsecolor;
pub mod info;
pub mod product;
pub mod projection;
pub mod raster;
pub mod segment;

pub use error::{Error, Result};
