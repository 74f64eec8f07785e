//! # Data Movement Manager
//!
//! A bandwidth-aware circuit lifecycle daemon that sits between a transfer
//! orchestrator and an SDN controller. Transfer rules are announced through
//! a three-phase RPC contract (PREPARER, SUBMITTER, FINISHER); DMM tracks
//! every announced request's priority-weighted fair share of its sites'
//! uplinks and keeps an SDN-provisioned circuit in sync with it.
//!
//! ## Architecture
//!
//! - **Site registry**: per-RSE uplink capacity, IPv6 subnet pools, and
//!   priority-weighted fair-share bookkeeping (`site`).
//! - **Request/Link entity**: the combined accounting + circuit lifecycle
//!   state machine for one (rule, src, dst) triple (`request`).
//! - **Coordinator**: owns both registries, runs the RPC listener, and
//!   implements the PREPARER/SUBMITTER/FINISHER handlers plus the
//!   recompute-and-dispatch cycle (`coordinator`).
//! - **Orchestrator**: a bounded worker pool with per-request-id job
//!   serialization, so concurrent RPCs touching the same request never race
//!   each other's SDN calls (`orchestrator`).
//! - **Adapters**: the SDN controller contract (`sdn_adapter`) and the
//!   metrics backend contract (`metrics_adapter`) that the coordinator calls
//!   through, each with a real HTTP-backed implementation and an in-memory
//!   mock for tests.
//! - **Persistence**: a crash-recovery store, written to asynchronously so a
//!   slow database never blocks an RPC handler (`persistence`).
//! - **Protocol & auth**: the length-prefixed JSON wire format and the
//!   symmetric HMAC challenge handshake that precedes it (`protocol`, `auth`).

/// Shared-secret HMAC challenge handshake for the RPC listener.
pub mod auth;
/// Ties the registries, the RPC listener, and the orchestrator together.
pub mod coordinator;
/// Error types for every component.
pub mod error;
/// Ambient operational telemetry (queue depth, job latency, SDN call latency).
pub mod metrics;
/// Contract for querying link utilization from a time-series backend.
pub mod metrics_adapter;
/// Bounded worker pool with per-request-id job serialization.
pub mod orchestrator;
/// Crash-recovery persistence for live requests.
pub mod persistence;
/// Wire protocol: length-prefixed JSON envelopes for PREPARER/SUBMITTER/FINISHER.
pub mod protocol;
/// The Request/Link entity: accounting plus circuit lifecycle.
pub mod request;
/// Contract for provisioning bandwidth-guaranteed circuits on an SDN controller.
pub mod sdn_adapter;
/// YAML-based configuration.
pub mod settings;
/// Per-site IPv6 pools and priority-weighted uplink shares.
pub mod site;

pub use coordinator::Coordinator;
pub use orchestrator::Orchestrator;
pub use request::Request;
pub use settings::Settings;
pub use site::Site;
