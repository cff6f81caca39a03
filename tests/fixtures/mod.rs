//! Shared test fixtures: a scriptable transport and client builders.
#![allow(dead_code)]

pub mod transport;
