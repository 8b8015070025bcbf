//! The wrapper fabric: translation between third-party device dialects and
//! the canonical RTK message model.
//!
//! A wrapper registers uplink routes (which foreign topics and payload
//! shapes it understands) and downlink routes (which device types it can
//! address). The [registry::WrapperRegistry] resolves each non-canonical
//! message to the highest-priority matching wrapper, whose
//! [transformer::WrapperTransformer] then produces a canonical message,
//! or the device dialect message on the way out.

pub mod home_assistant;
pub mod registry;
pub mod transformer;

pub use home_assistant::HomeAssistantWrapper;
pub use registry::WrapperRegistry;
pub use transformer::PayloadRule;
pub use transformer::PayloadType;
pub use transformer::RouteRule;
pub use transformer::TransformError;
pub use transformer::UplinkOutput;
pub use transformer::WrapperRegistration;
pub use transformer::WrapperTransformer;
