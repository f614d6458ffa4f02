//! Types shared between the pointledger server and its API consumers.

pub mod api;
pub mod domain;
