// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod engine_config;

pub use self::engine_config::{EngineConfig, FlatConfig, PropertySource};
