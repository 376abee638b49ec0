pub mod group;
pub mod manager;
pub mod metrics;
pub mod oci;
pub mod probe;
pub mod registry;
pub mod signal;
pub mod test_utils;
pub mod timeout;
