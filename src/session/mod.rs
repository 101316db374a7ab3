//! # Call Session Management
//!
//! Per-call lifecycle state: the validated call state machine, its
//! observability trace, the owned per-call session object, and the registry
//! that maps carrier stream ids to live sessions.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: carrier transport open, no start event yet
//! 2. **Greeting**: agent greeting being synthesized and delivered
//! 3. **Listening**: accumulating caller audio
//! 4. **Processing**: transcribing and generating a reply
//! 5. **Speaking**: delivering synthesized reply frames
//! 6. **Disconnecting / Disconnected**: teardown; Disconnected is terminal
//! 7. **Error**: unrecoverable fault, drains to Disconnected

pub mod registry; // Stream id → session map
pub mod session; // Owned per-call state
pub mod state_machine; // Validated lifecycle transitions
pub mod trace; // Diagnostics companion
