//! Declarative mapping rules: JMESPath filters and actions that write tags,
//! groups and named extras for one upstream record.

pub mod config;
pub mod engine;
pub mod query;
pub mod value;

pub use config::{
    Action, ActionInput, ConfigError, Destination, Rule, RuleSet, RuleSetConfig, ValueTable,
    GROUP_DESTINATION, TAG_DESTINATION,
};
pub use engine::{apply, ApplyReport, GroupDirectory, MappingWarning};
pub use query::{PathQuery, QueryError};

pub const CRATE_NAME: &str = "gnh-rules";
