//! kdi-k8s: deployment update service for remote Kubernetes clusters
//!
//! Callers hand over cluster credentials per request; the service connects,
//! then applies rolling, recreate, or blue/green updates, reports deployment
//! status, and creates objects without overwriting existing ones.

pub mod cancel;
pub mod cluster;
pub mod config;
pub mod objects;
pub mod server;
pub mod update;
