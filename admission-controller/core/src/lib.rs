#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod filter;
pub mod labels;
pub mod patch;

pub use self::filter::NamespaceFilter;
