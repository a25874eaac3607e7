//! Read and write packets
//!
//! A read packet pulls bytes out of the socket's `PreBuffer` until its
//! completion rule is met. Nothing here touches the socket; the engine
//! fills the prebuffer and asks the packet to take what it needs.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::prebuffer::PreBuffer;
use crate::Tag;

/// Completion rule of a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadKind {
    /// Whatever is available, at most `max` bytes
    Available { max: Option<usize> },
    /// Exactly this many bytes
    Length(usize),
    /// Up to and including the terminator, failing past `max` bytes
    Terminator { term: Vec<u8>, max: Option<usize> },
}

impl ReadKind {
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            ReadKind::Available { max: Some(0) } => {
                Err(Error::BadParam("maximum length must be positive".into()))
            }
            ReadKind::Length(0) => Err(Error::BadParam("read length must be positive".into())),
            ReadKind::Terminator { term, .. } if term.is_empty() => {
                Err(Error::BadParam("terminator must not be empty".into()))
            }
            ReadKind::Terminator {
                term,
                max: Some(max),
            } if *max < term.len() => Err(Error::BadParam(format!(
                "maximum length {} is shorter than the {}-byte terminator",
                max,
                term.len()
            ))),
            _ => Ok(()),
        }
    }
}

/// Result of offering buffered bytes to a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadProgress {
    /// Took this many bytes and needs more
    Incomplete(usize),
    /// The packet is done
    Complete,
    /// `max` bytes collected without finding the terminator
    MaxedOut,
}

#[derive(Debug)]
pub(crate) struct ReadPacket {
    pub id: u64,
    pub kind: ReadKind,
    pub buffer: Vec<u8>,
    pub timeout: Option<Duration>,
    pub tag: Tag,
}

impl ReadPacket {
    pub(crate) fn new(id: u64, kind: ReadKind, timeout: Option<Duration>, tag: Tag) -> Self {
        let buffer = match &kind {
            ReadKind::Length(n) => Vec::with_capacity(*n),
            _ => Vec::new(),
        };
        Self {
            id,
            kind,
            buffer,
            timeout,
            tag,
        }
    }

    pub(crate) fn bytes_done(&self) -> usize {
        self.buffer.len()
    }

    /// Move bytes from `pre` into the packet
    pub(crate) fn take_from(&mut self, pre: &mut PreBuffer) -> ReadProgress {
        match &self.kind {
            ReadKind::Available { max } => {
                if pre.is_empty() {
                    return ReadProgress::Incomplete(0);
                }
                let n = max.unwrap_or(usize::MAX).min(pre.available());
                pre.drain_into(n, &mut self.buffer);
                ReadProgress::Complete
            }

            ReadKind::Length(length) => {
                let wanted = length - self.buffer.len();
                let n = pre.drain_into(wanted, &mut self.buffer);
                if self.buffer.len() == *length {
                    ReadProgress::Complete
                } else {
                    ReadProgress::Incomplete(n)
                }
            }

            ReadKind::Terminator { term, max } => {
                let room = max
                    .map(|m| m.saturating_sub(self.buffer.len()))
                    .unwrap_or(usize::MAX);
                let candidate = &pre.readable()[..room.min(pre.available())];

                // the terminator may straddle what we already hold
                let overlap = (term.len() - 1).min(self.buffer.len());
                let tail = &self.buffer[self.buffer.len() - overlap..];

                if let Some(n) = terminator_end(tail, candidate, term) {
                    pre.drain_into(n, &mut self.buffer);
                    return ReadProgress::Complete;
                }

                let n = candidate.len();
                pre.drain_into(n, &mut self.buffer);
                if max.is_some_and(|m| self.buffer.len() >= m) {
                    ReadProgress::MaxedOut
                } else {
                    ReadProgress::Incomplete(n)
                }
            }
        }
    }
}

/// Bytes of `data` to take so the terminator ends the packet
///
/// `tail` holds bytes already in the packet; a match must end inside
/// `data`.
fn terminator_end(tail: &[u8], data: &[u8], term: &[u8]) -> Option<usize> {
    let total = tail.len() + data.len();
    let at = |i: usize| {
        if i < tail.len() {
            tail[i]
        } else {
            data[i - tail.len()]
        }
    };

    (term.len().max(tail.len() + 1)..=total)
        .find(|&end| {
            let start = end - term.len();
            term.iter().enumerate().all(|(k, b)| at(start + k) == *b)
        })
        .map(|end| end - tail.len())
}

#[derive(Debug)]
pub(crate) struct WritePacket {
    pub id: u64,
    pub data: Vec<u8>,
    pub written: usize,
    pub timeout: Option<Duration>,
    pub tag: Tag,
}

impl WritePacket {
    pub(crate) fn new(id: u64, data: Vec<u8>, timeout: Option<Duration>, tag: Tag) -> Self {
        Self {
            id,
            data,
            written: 0,
            timeout,
            tag,
        }
    }

    pub(crate) fn remaining(&self) -> &[u8] {
        &self.data[self.written..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.written = (self.written + n).min(self.data.len());
    }

    pub(crate) fn is_done(&self) -> bool {
        self.written == self.data.len()
    }
}

/// Entries of the read queue
#[derive(Debug)]
pub(crate) enum ReadItem {
    Data(ReadPacket),
    StartTls,
}

/// Entries of the write queue
#[derive(Debug)]
pub(crate) enum WriteItem {
    Data(WritePacket),
    StartTls,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pre(bytes: &[u8]) -> PreBuffer {
        let mut pre = PreBuffer::new();
        pre.extend_from_slice(bytes);
        pre
    }

    #[test]
    fn test_validate() {
        assert!(ReadKind::Length(0).validate().is_err());
        assert!(ReadKind::Available { max: Some(0) }.validate().is_err());
        assert!(ReadKind::Available { max: None }.validate().is_ok());
        assert!(ReadKind::Terminator {
            term: Vec::new(),
            max: None
        }
        .validate()
        .is_err());
        let err = ReadKind::Terminator {
            term: b"\r\n".to_vec(),
            max: Some(1),
        }
        .validate()
        .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_length_across_fills() {
        let mut packet = ReadPacket::new(1, ReadKind::Length(5), None, 0);
        let mut buf = pre(b"abc");
        assert_eq!(packet.take_from(&mut buf), ReadProgress::Incomplete(3));
        assert!(buf.is_empty());

        buf.extend_from_slice(b"defg");
        assert_eq!(packet.take_from(&mut buf), ReadProgress::Complete);
        assert_eq!(packet.buffer, b"abcde");
        assert_eq!(buf.readable(), b"fg");
    }

    #[test]
    fn test_available_respects_max() {
        let mut packet = ReadPacket::new(1, ReadKind::Available { max: Some(4) }, None, 0);
        let mut buf = PreBuffer::new();
        assert_eq!(packet.take_from(&mut buf), ReadProgress::Incomplete(0));

        buf.extend_from_slice(b"0123456789");
        assert_eq!(packet.take_from(&mut buf), ReadProgress::Complete);
        assert_eq!(packet.buffer, b"0123");
        assert_eq!(buf.available(), 6);
    }

    #[test]
    fn test_terminator_split_across_fills() {
        let kind = ReadKind::Terminator {
            term: b"\r\n".to_vec(),
            max: None,
        };
        let mut packet = ReadPacket::new(1, kind, None, 0);

        let mut buf = pre(b"hello\r");
        assert_eq!(packet.take_from(&mut buf), ReadProgress::Incomplete(6));

        buf.extend_from_slice(b"\nnext");
        assert_eq!(packet.take_from(&mut buf), ReadProgress::Complete);
        assert_eq!(packet.buffer, b"hello\r\n");
        assert_eq!(buf.readable(), b"next");
    }

    #[test]
    fn test_terminator_first_match_wins() {
        let kind = ReadKind::Terminator {
            term: b"\n".to_vec(),
            max: None,
        };
        let mut packet = ReadPacket::new(1, kind, None, 0);
        let mut buf = pre(b"a\nb\n");
        assert_eq!(packet.take_from(&mut buf), ReadProgress::Complete);
        assert_eq!(packet.buffer, b"a\n");
        assert_eq!(buf.readable(), b"b\n");
    }

    #[test]
    fn test_terminator_maxed_out() {
        let kind = ReadKind::Terminator {
            term: b"\n".to_vec(),
            max: Some(4),
        };
        let mut packet = ReadPacket::new(1, kind, None, 0);
        let mut buf = pre(b"abcdef\n");
        assert_eq!(packet.take_from(&mut buf), ReadProgress::MaxedOut);
        assert_eq!(packet.bytes_done(), 4);
    }

    #[test]
    fn test_terminator_at_max_boundary() {
        let kind = ReadKind::Terminator {
            term: b"\n".to_vec(),
            max: Some(4),
        };
        let mut packet = ReadPacket::new(1, kind, None, 0);
        let mut buf = pre(b"abc\nrest");
        assert_eq!(packet.take_from(&mut buf), ReadProgress::Complete);
        assert_eq!(packet.buffer, b"abc\n");
    }

    #[test]
    fn test_terminator_end() {
        assert_eq!(terminator_end(b"", b"ab\r\n", b"\r\n"), Some(4));
        assert_eq!(terminator_end(b"\r", b"\nx", b"\r\n"), Some(1));
        assert_eq!(terminator_end(b"", b"ab", b"\r\n"), None);
        // a match entirely inside the tail was already rejected earlier
        assert_eq!(terminator_end(b"\n", b"", b"\n"), None);
    }

    #[test]
    fn test_write_progress() {
        let mut packet = WritePacket::new(1, b"ABC".to_vec(), None, 1);
        packet.advance(2);
        assert_eq!(packet.remaining(), b"C");
        assert!(!packet.is_done());
        packet.advance(5);
        assert!(packet.is_done());
    }
}
