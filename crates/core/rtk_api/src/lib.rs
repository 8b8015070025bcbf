//! The canonical message model of the RTK diagnostic control plane.
//!
//! Devices and controllers exchange JSON documents over a five-segment
//! topic space, `rtk/v1/<tenant>/<site>/<device_id>/<kind>`. This crate
//! defines that topic schema ([topics]), the typed payloads and their
//! envelope ([envelope]), the schema registry validating them ([schema]),
//! and the codec converting between typed messages and raw MQTT messages
//! ([codec]). Payloads of unknown shape, as produced by non-RTK devices,
//! are navigated with [flex::FlexPayload].

pub mod clock;
pub mod codec;
pub mod envelope;
pub mod flex;
pub mod schema;
pub mod topics;
