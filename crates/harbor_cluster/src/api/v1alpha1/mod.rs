pub mod chartmuseum;
pub mod harbor_core;
pub mod jobservice;
pub mod notary;
pub mod platform;
pub mod platform_configuration;
pub mod platform_project;
pub mod portal;
pub mod project_binding;
pub mod registry;
pub mod registry_controller;
pub mod scanner;
pub mod server_configuration;

pub use self::chartmuseum::*;
pub use self::harbor_core::*;
pub use self::jobservice::*;
pub use self::notary::*;
pub use self::platform::*;
pub use self::platform_configuration::*;
pub use self::platform_project::*;
pub use self::portal::*;
pub use self::project_binding::*;
pub use self::registry::*;
pub use self::registry_controller::*;
pub use self::scanner::*;
pub use self::server_configuration::*;

/// Schema for free-form JSON objects kept verbatim by the API server.
pub fn preserve_unknown_fields(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    }))
    .expect("static schema is valid")
}
