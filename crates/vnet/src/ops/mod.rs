//! Operator front-end: validation and dispatch of portable primitives.

pub mod functional;
