//! Process bootstrap helpers shared by binaries.

pub mod bootstrap;
