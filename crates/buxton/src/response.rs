//! Decoded daemon replies as seen by callbacks.

use buxton_proto::{MessageType, Param, Status, Value};

/// One reply frame from the daemon: either a `Status` answering a request
/// or a `Changed` notification for a watched key.
#[derive(Debug, Clone)]
pub struct Response {
    msg_type: MessageType,
    msgid: u64,
    params: Vec<Param>,
}

impl Response {
    pub(crate) fn new(msg_type: MessageType, msgid: u64, params: Vec<Param>) -> Self {
        Self {
            msg_type,
            msgid,
            params,
        }
    }

    /// Returns the reply kind: `Status` or `Changed`.
    #[must_use]
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    /// Returns the correlation id. For `Changed` frames this is the msgid
    /// of the `NOTIFY` that registered the watch.
    #[must_use]
    pub fn msgid(&self) -> u64 {
        self.msgid
    }

    /// Returns the raw parameters.
    #[must_use]
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Returns the status carried by a `Status` frame. `Changed` frames
    /// report [`Status::Ok`].
    #[must_use]
    pub fn status(&self) -> Status {
        match self.msg_type {
            MessageType::Changed => Status::Ok,
            _ => self
                .params
                .first()
                .and_then(|param| match param.value {
                    Value::Int32(code) => Status::from_code(code),
                    _ => None,
                })
                .unwrap_or(Status::MessageCorrupt),
        }
    }

    /// Returns the value payload, when the reply carries one: the
    /// retrieved value of a `GET`, or the new value of a `Changed`. A
    /// `Changed` frame without a value reports a removal.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.params.get(1).map(|param| &param.value)
    }

    /// Returns the key name of a `Changed` frame, or the key echoed by an
    /// `UNNOTIFY` acknowledgement.
    #[must_use]
    pub fn key_name(&self) -> Option<&str> {
        let index = match self.msg_type {
            MessageType::Changed => 0,
            _ => 1,
        };
        self.params.get(index).and_then(|param| param.value.as_str())
    }

    /// Returns the msgid echoed by an `UNNOTIFY` acknowledgement.
    #[must_use]
    pub fn removed_msgid(&self) -> Option<u64> {
        self.params.get(2).and_then(|param| match param.value {
            Value::Uint64(msgid) => Some(msgid),
            _ => None,
        })
    }

    /// Returns the key strings of a `LIST` reply.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.params
            .iter()
            .skip(1)
            .filter_map(|param| param.value.as_str())
            .collect()
    }

    /// Returns `true` when a `Changed` frame reports a removed key.
    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.msg_type == MessageType::Changed && self.params.len() == 1
    }
}
