// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod pool;
pub mod train;
