//! Types shared by every tabmon crate.
//!
//! The [`value::Value`] model is what every backend adapter normalises its
//! wire types into, [`row::Row`] is one normalised result row, and
//! [`descriptor::ConnectionArgs`] is the argument grammar all adapters use
//! to read their connection descriptors.

pub mod descriptor;
pub mod row;
pub mod types;
pub mod value;
