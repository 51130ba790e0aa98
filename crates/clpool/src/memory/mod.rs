//! Memory object abstractions.
//!
//! This module provides element typing, host-side staging, and the shape
//! bookkeeping used to validate transfers before they reach the driver.

mod element;
mod object;

pub use element::*;
pub use object::*;
