//! Test support for the Doris sink: an in-process FE/BE pair implementing stream load, with
//! fault injection.

mod error_injector;
pub use error_injector::ErrorInjector;

mod server;
pub use server::{LoadRequest, MockDoris};
