//! Stateless codec for the line-oriented wire format.
//!
//! Messages are ASCII lines with `|`-separated fields. The ingest side
//! tolerates both `\n` and `\r\n` terminators (any run of `\r`/`\n` counts as
//! a single delimiter); the notification side always emits a bare `\n`.
//!
//! Parsing is at-most-effort by design: malformed input never produces an
//! error, it produces an [`EventKind::Invalid`] event (or `None` for ids)
//! that the engine silently drops.

/// A user identity on the wire. Legitimate ids are never zero.
pub type UserId = i64;

/// An event sequence number. The stream is 1-based and gapless.
pub type Seqnum = i64;

/// Sequence number of the first event of a stream.
pub const FIRST_SEQNUM: Seqnum = 1;

/// Field separator within a message.
const DELIMITER: char = '|';

/// Kind of a wire event, decoded from its single-character tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Follow,
    Unfollow,
    Broadcast,
    Private,
    StatusUpdate,
    /// Unrecognized tag, multi-character tag, or too many fields.
    Invalid,
}

impl EventKind {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "F" => Self::Follow,
            "U" => Self::Unfollow,
            "B" => Self::Broadcast,
            "P" => Self::Private,
            "S" => Self::StatusUpdate,
            _ => Self::Invalid,
        }
    }
}

/// A parsed wire event. Immutable once parsed; `payload` keeps the original
/// line (terminator stripped) because notifications re-encode it verbatim.
#[derive(Debug, Clone)]
pub struct Event {
    pub payload: String,
    pub seqnum: Option<Seqnum>,
    pub kind: EventKind,
    pub from_user: Option<UserId>,
    pub to_user: Option<UserId>,
}

impl Event {
    /// Parses one message into an event. Never fails; anything that does not
    /// fit the format comes back with `kind == Invalid` or missing ids and is
    /// rejected by [`Event::is_valid`].
    pub fn parse(payload: &str) -> Self {
        let mut fields = payload.split(DELIMITER);

        let seqnum = fields.next().and_then(parse_long);
        let kind = fields.next().map_or(EventKind::Invalid, EventKind::from_tag);
        let from_user = fields.next().and_then(parse_long);
        let to_user = fields.next().and_then(parse_long);

        // Anything beyond seqnum|kind|from|to is not a known message shape.
        let kind = if fields.next().is_some() {
            EventKind::Invalid
        } else {
            kind
        };

        Self {
            payload: payload.to_owned(),
            seqnum,
            kind,
            from_user,
            to_user,
        }
    }

    /// Validity table: every kind constrains which user ids must be present.
    ///
    /// | kind               | seqnum | from    | to      |
    /// |--------------------|--------|---------|---------|
    /// | Broadcast          | valid  | absent  | absent  |
    /// | Follow/Unfollow/Private | valid | present | present |
    /// | StatusUpdate       | valid  | present | absent  |
    /// | Invalid            | never valid |    |         |
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.seqnum.is_none() {
            return false;
        }

        match self.kind {
            EventKind::Broadcast => self.from_user.is_none() && self.to_user.is_none(),
            EventKind::Follow | EventKind::Unfollow | EventKind::Private => {
                self.from_user.is_some() && self.to_user.is_some()
            }
            EventKind::StatusUpdate => self.from_user.is_some() && self.to_user.is_none(),
            EventKind::Invalid => false,
        }
    }
}

/// Integer parse with a single "invalid" outcome: `0`, overflow, and
/// non-numeric input all yield `None`.
#[must_use]
pub fn parse_long(s: &str) -> Option<i64> {
    match s.trim().parse::<i64>() {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n),
    }
}

/// Extracts the next complete message from `input` starting at `*start`.
///
/// Any run of `\r`/`\n` characters is treated as one delimiter. On success,
/// `*start` is advanced past the message and its trailing delimiter run. When
/// no complete message remains, `*start` is left at the beginning of the
/// unterminated remainder (possibly `input.len()`), so the caller can retain
/// exactly that remainder and retry once more input arrives. A buffer
/// containing nothing but delimiters yields no message.
pub fn find_message<'a>(input: &'a str, start: &mut usize) -> Option<&'a str> {
    let bytes = input.as_bytes();
    let mut pos = *start;

    while pos < bytes.len() && is_terminator(bytes[pos]) {
        pos += 1;
    }
    let message_start = pos;

    while pos < bytes.len() && !is_terminator(bytes[pos]) {
        pos += 1;
    }

    if pos == bytes.len() {
        // Unterminated remainder (or nothing at all); not a message yet.
        *start = message_start;
        return None;
    }

    let message = &input[message_start..pos];
    while pos < bytes.len() && is_terminator(bytes[pos]) {
        pos += 1;
    }
    *start = pos;
    Some(message)
}

/// Encodes a notification payload into its wire form: payload + `\n`.
///
/// Note the asymmetry with the ingest side: delivered messages always use a
/// bare `\n`, even though `\r\n` is tolerated on input.
#[must_use]
pub fn encode_message(payload: &str) -> String {
    let mut message = String::with_capacity(payload.len() + 1);
    message.push_str(payload);
    message.push('\n');
    message
}

const fn is_terminator(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}
