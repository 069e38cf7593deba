//! Row models for the rule store and the event store.

pub mod alert_event;
pub mod alert_mute;
pub mod alert_rule;
pub mod datasource;
pub mod resource;
pub mod user;

pub use alert_event::*;
pub use alert_mute::*;
pub use alert_rule::*;
pub use datasource::*;
pub use resource::*;
pub use user::*;
