pub mod command;
pub mod docker;
pub mod process;
pub mod registry;
pub mod runtime;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
