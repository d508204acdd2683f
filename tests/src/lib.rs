//! # Bit-Fever Messaging Test Suite
//!
//! End-to-end scenarios across `bf-envelope`, `bf-bus` and `bf-runtime`,
//! run against the in-process broker.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── fixtures.rs          # Shared setup: broker, supervisor, recorders
//! └── integration/
//!     ├── delivery.rs      # Fanout, ack, poison, legacy producers
//!     ├── reliability.rs   # Serialized publish, reconnect, retry, shutdown
//!     └── runtime.rs       # The assembled runtime
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p bf-tests
//! cargo test -p bf-tests integration::reliability::
//! ```

#[cfg(test)]
mod fixtures;
#[cfg(test)]
mod integration;
