#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use
)]

pub mod agents;
pub mod config;
pub mod events;
pub mod http;
pub mod obs;
pub mod runtime;
