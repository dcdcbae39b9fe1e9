//! Low-level kernel communication.

mod argument;

mod request;
pub use request::{Operation, Request, RequestError};

#[cfg(test)]
pub(crate) use request::test as request_test;
