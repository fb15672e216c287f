//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! caller-built ConnectorConfig (or deserialized from a config file)
//!     → validation.rs (semantic checks at connect time)
//!     → shared by value with every router engine
//! ```
//!
//! # Design Decisions
//! - Config is plain data; the two HTTP clients are attached to the
//!   Connector itself so the schema stays serializable
//! - All optional fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod schema;
pub mod validation;

pub use schema::ConnectorConfig;
pub use validation::ConfigError;
