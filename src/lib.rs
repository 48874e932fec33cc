//! Real-time media engine for end-to-end encrypted one-to-one calls.
//!
//! Raw audio goes in, encrypted loss-tolerant packets come out, and the
//! reverse on the receive side. Call setup, teardown and connection health
//! are driven by [`calls::CallManager`].

pub mod calls;
pub mod crypto;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use calls::{
    CallError, CallEvent, CallId, CallManager, CallManagerConfig, CallMediaType, CallState,
    EndCallReason, PeerRef,
};
