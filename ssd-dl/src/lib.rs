//! The building blocks of anchor-based detection training and evaluation.

mod common;

pub mod anchor;
pub mod decode;
pub mod label;
pub mod loss;
pub mod prediction;
