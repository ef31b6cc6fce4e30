//! Call session layer.
//!
//! Everything above the core workers: the call state machine, the
//! collaborator seams for telephony and SMS, the canned instruction/template
//! text, and the controller actor tying it all together.

pub mod controller;
pub mod state;
pub mod telephony;
pub mod templates;

pub use controller::{CallError, CallSessionController, CallSessionHandle, RecoverableError};
pub use state::{CallContext, CallSession, CallState, Direction};
pub use telephony::{AudioRoute, SmsOutbox, TelephonyControl, TelephonyError, TelephonyEvent};
