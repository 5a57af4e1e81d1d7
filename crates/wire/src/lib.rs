//! Wire-level definitions shared by every role: keys, opcodes, and the
//! fixed-layout request slot and response records.

mod key;
mod op;
mod record;

pub use key::{keyspace, Key};
pub use op::{OpKind, SlotState, OP_GET, OP_IDLE, OP_PUT, WIRE_OFFSET};
pub use record::{
    decode_payload, decode_response, encode_response, encode_slot, Response, SlotOp, KEY_LEN,
    MAX_RESPONSE_LEN, MAX_SLOT_VALUE_LEN, REJECTED_LEN, SLOT_SIZE,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown opcode byte {0:#04x}")]
    UnknownOpcode(u8),
    #[error("value of {len} bytes exceeds the {max}-byte slot budget")]
    ValueTooLong { len: usize, max: usize },
    #[error("record is truncated: {0}")]
    Truncated(&'static str),
    #[error("buffer of {got} bytes does not hold a {want}-byte slot")]
    BadSlotLen { got: usize, want: usize },
}
