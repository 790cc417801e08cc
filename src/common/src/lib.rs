#![doc = include_str!("../README.md")]

pub mod locator;
pub mod mock_store;

pub use locator::{LocatorError, ObjectLocator};
