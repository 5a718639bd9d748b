//! OCPP 1.6-J protocol layer
//!
//! - `types`: OCPP 1.6 enumerations, request and response payloads
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)
//! - `codec`: mapping between OCPP actions and the session core's message contract

pub mod types;
pub mod messages;
pub mod codec;

pub use types::*;
pub use messages::*;
pub use codec::{decode_inbound, decode_reply, encode_reply, encode_request, error_code_for};
