use crate::{Error, Key, OpKind};

/// A request slot fills exactly one cache line. A client writes the whole
/// slot in one remote write, and the poller reads the opcode byte with a
/// plain load, so a slot must never straddle two lines.
pub const SLOT_SIZE: usize = 64;
pub const KEY_LEN: usize = 16;
/// Largest value that fits a slot alongside the key, length, and opcode.
pub const MAX_SLOT_VALUE_LEN: usize = SLOT_SIZE - KEY_LEN - 2;
/// Response `val_len` marking a rejected operation.
pub const REJECTED_LEN: u8 = 0xff;
/// A response is a length byte plus at most 255 value bytes.
pub const MAX_RESPONSE_LEN: usize = 256;

const VAL_LEN_AT: usize = KEY_LEN;
const VAL_AT: usize = KEY_LEN + 1;
const OPCODE_AT: usize = SLOT_SIZE - 1;

/// One decoded request, borrowed from the slot it arrived in. The value is
/// empty for a GET.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotOp<'a> {
    pub kind: OpKind,
    pub key: Key,
    pub value: &'a [u8],
}

/// Serialize a request into `buf`, which must be a whole slot.
///
/// Ascending addresses hold `key | val_len | value | pad`, and the opcode
/// lands in the slot's final byte: a remote write delivers bytes in
/// ascending address order, so a poller that observes a nonzero opcode is
/// guaranteed to observe everything before it.
pub fn encode_slot(buf: &mut [u8], key: Key, kind: OpKind, value: &[u8]) -> Result<(), Error> {
    if buf.len() != SLOT_SIZE {
        return Err(Error::BadSlotLen {
            got: buf.len(),
            want: SLOT_SIZE,
        });
    }
    if value.len() > MAX_SLOT_VALUE_LEN {
        return Err(Error::ValueTooLong {
            len: value.len(),
            max: MAX_SLOT_VALUE_LEN,
        });
    }

    buf.fill(0);
    buf[..KEY_LEN].copy_from_slice(&key.to_bytes());
    if let OpKind::Put = kind {
        buf[VAL_LEN_AT] = value.len() as u8;
        buf[VAL_AT..VAL_AT + value.len()].copy_from_slice(value);
    }
    buf[OPCODE_AT] = kind.wire_code();
    Ok(())
}

/// Decode the body of an occupied slot: every byte below the opcode.
/// The caller has already observed the opcode and decoded `kind` from it.
pub fn decode_payload(kind: OpKind, body: &[u8]) -> Result<SlotOp<'_>, Error> {
    if body.len() != SLOT_SIZE - 1 {
        return Err(Error::BadSlotLen {
            got: body.len(),
            want: SLOT_SIZE - 1,
        });
    }

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&body[..KEY_LEN]);
    let key = Key::from_bytes(key);

    let value = match kind {
        OpKind::Get => &body[..0],
        OpKind::Put => {
            let len = body[VAL_LEN_AT] as usize;
            if len > MAX_SLOT_VALUE_LEN {
                return Err(Error::ValueTooLong {
                    len,
                    max: MAX_SLOT_VALUE_LEN,
                });
            }
            &body[VAL_AT..VAL_AT + len]
        }
    };

    Ok(SlotOp { kind, key, value })
}

/// A response record: a length byte followed by the value bytes. A zero
/// length is a legal empty response (not-found, or a PUT acknowledgement);
/// the all-ones length marks a rejected operation.
#[derive(Debug, PartialEq, Eq)]
pub enum Response<'a> {
    Value(&'a [u8]),
    Empty,
    Rejected,
}

/// Serialize a response into `buf`, returning the bytes used.
pub fn encode_response(buf: &mut [u8], response: &Response<'_>) -> Result<usize, Error> {
    match response {
        Response::Value(value) if value.is_empty() => encode_response(buf, &Response::Empty),
        Response::Value(value) => {
            if value.len() >= REJECTED_LEN as usize {
                return Err(Error::ValueTooLong {
                    len: value.len(),
                    max: REJECTED_LEN as usize - 1,
                });
            }
            if buf.len() < 1 + value.len() {
                return Err(Error::Truncated("response buffer"));
            }
            buf[0] = value.len() as u8;
            buf[1..1 + value.len()].copy_from_slice(value);
            Ok(1 + value.len())
        }
        Response::Empty => {
            if buf.is_empty() {
                return Err(Error::Truncated("response buffer"));
            }
            buf[0] = 0;
            Ok(1)
        }
        Response::Rejected => {
            if buf.is_empty() {
                return Err(Error::Truncated("response buffer"));
            }
            buf[0] = REJECTED_LEN;
            Ok(1)
        }
    }
}

pub fn decode_response(bytes: &[u8]) -> Result<Response<'_>, Error> {
    let (&len, rest) = bytes
        .split_first()
        .ok_or(Error::Truncated("empty response"))?;
    match len {
        0 => Ok(Response::Empty),
        REJECTED_LEN => Ok(Response::Rejected),
        len => {
            let value = rest
                .get(..len as usize)
                .ok_or(Error::Truncated("response value"))?;
            Ok(Response::Value(value))
        }
    }
}
