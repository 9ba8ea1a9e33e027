pub mod batch;
pub mod cache;
pub mod config;
pub mod counter;
pub mod error;
pub mod ring;
pub mod storage;
pub mod telemetry;
pub mod test_utils;
pub mod utils;

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;
