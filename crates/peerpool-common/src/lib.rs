// SPDX-License-Identifier: MIT

//! Small pieces shared by every peerpool crate. Nothing in here knows about
//! connections or pools; it only holds helpers that more than one crate needs.

pub mod hash;
pub mod macros;

pub use hash::Hash256;
pub use hash::HashParseError;
