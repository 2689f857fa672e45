//! Top-level convenience crate: re-exports the engine crate so embedders
//! can depend on a single `sigmasockets` package.

pub use sigmasockets_server::*;

pub mod client {
    pub use sigmasockets_client::*;
}
