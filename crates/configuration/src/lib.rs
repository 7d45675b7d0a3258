pub mod configuration;
pub mod environment;
pub mod error;
pub mod values;

pub use configuration::{
    create_state, make_runtime_configuration, parse_configuration, write_parsed_configuration,
    Configuration, ParsedConfiguration, State, DEFAULT_CONNECTION_URI_VARIABLE,
};
pub use values::{ConnectionUri, PoolSettings, Secret};
