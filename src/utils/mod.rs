//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `courier` crate.
//!
//! It centralizes the error types shared by the listeners, the access point and
//! the log store, plus the logging bootstrap used by the binary and the tests.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
        logging::init("not-a-level");
    }
}
