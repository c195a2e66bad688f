//! Framing and status multiplexing.
//!
//! Every frame on either channel starts with a signed 32-bit little-endian
//! length prefix:
//!
//! - `length > 0` - that many payload bytes follow
//! - `length == 0` - heartbeat, no payload
//! - `length < 0` - an out-of-band control code for the lifecycle state
//!   machine, never delivered as application data
//!
//! The sign multiplexing stays on the wire for compatibility; in memory a
//! prefix is decoded into a [`StreamFrame`] at this boundary and nothing
//! downstream ever re-inspects the sign. Control codes travel only on the
//! stream channel: a datagram with a negative declared length is a
//! protocol violation, not a lifecycle message.

use super::config::ChannelSettings;
use super::error::DisconnectReason;
use super::packet::LENGTH_PREFIX;

/// One decoded frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StreamFrame {
    /// Application payload bytes.
    Payload(Vec<u8>),
    /// Zero-length liveness frame.
    Heartbeat,
    /// Out-of-band control code (always negative on the wire).
    Control(i32),
}

/// Encodes a heartbeat frame.
#[inline]
pub(crate) fn heartbeat_bytes() -> [u8; LENGTH_PREFIX] {
    0i32.to_le_bytes()
}

/// Encodes a control code frame.
#[inline]
pub(crate) fn control_bytes(code: i32) -> [u8; LENGTH_PREFIX] {
    debug_assert!(code < 0, "control codes are negative");
    code.to_le_bytes()
}

/// Reassembles frames from a byte stream, carrying partial frames across
/// reads and yielding multiple frames when a single read covers more than
/// one.
pub(crate) struct FrameAccumulator {
    buf: Vec<u8>,
    max_packet_size: usize,
    buffer_size: usize,
}

impl FrameAccumulator {
    pub(crate) fn new(settings: &ChannelSettings) -> Self {
        Self {
            buf: Vec::with_capacity(settings.buffer_size),
            max_packet_size: settings.max_packet_size,
            buffer_size: settings.buffer_size,
        }
    }

    /// Appends bytes read from the socket.
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are
    /// needed, or the disconnect reason for a declared length the channel
    /// settings reject.
    pub(crate) fn next(&mut self) -> Result<Option<StreamFrame>, DisconnectReason> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let declared = i32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

        if declared < 0 {
            self.buf.drain(..LENGTH_PREFIX);
            return Ok(Some(StreamFrame::Control(declared)));
        }
        if declared == 0 {
            self.buf.drain(..LENGTH_PREFIX);
            return Ok(Some(StreamFrame::Heartbeat));
        }

        let declared = declared as usize;
        // Validate the declared length before waiting for payload bytes a
        // hostile peer may never send.
        if declared > self.buffer_size {
            return Err(DisconnectReason::PacketOverBufferSize);
        }
        if declared > self.max_packet_size {
            return Err(DisconnectReason::PacketOverMaxSize);
        }

        if self.buf.len() < LENGTH_PREFIX + declared {
            return Ok(None);
        }

        let payload = self.buf[LENGTH_PREFIX..LENGTH_PREFIX + declared].to_vec();
        // Retain leftover bytes belonging to the next frame.
        self.buf.drain(..LENGTH_PREFIX + declared);
        Ok(Some(StreamFrame::Payload(payload)))
    }
}

/// One decoded datagram. Lifecycle control codes never travel over the
/// datagram channel, so there is no control variant to route.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DatagramFrame {
    /// Application payload bytes.
    Payload(Vec<u8>),
    /// Zero-length liveness frame.
    Heartbeat,
}

/// Decodes a whole datagram into one frame.
///
/// Unlike the byte stream, a datagram arrives complete, so the declared
/// length must equal the remaining bytes exactly; any mismatch is a
/// protocol violation. A negative declared length is also a violation:
/// disconnect codes are sent on the stream channel only, so a datagram
/// claiming to carry one is forged or corrupt.
pub(crate) fn parse_datagram(
    datagram: &[u8],
    settings: &ChannelSettings,
) -> Result<DatagramFrame, DisconnectReason> {
    debug_assert!(datagram.len() >= LENGTH_PREFIX, "short datagrams are dropped earlier");

    let declared = i32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    let actual = datagram.len() - LENGTH_PREFIX;

    if declared < 0 {
        return Err(DisconnectReason::InvalidPacket);
    }
    if declared as usize != actual {
        return Err(DisconnectReason::InvalidPacket);
    }
    if declared == 0 {
        return Ok(DatagramFrame::Heartbeat);
    }

    let declared = declared as usize;
    if declared > settings.buffer_size {
        return Err(DisconnectReason::PacketOverBufferSize);
    }
    if declared > settings.max_packet_size {
        return Err(DisconnectReason::PacketOverMaxSize);
    }

    Ok(DatagramFrame::Payload(datagram[LENGTH_PREFIX..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ChannelSettings {
        ChannelSettings {
            max_packet_size: 128,
            buffer_size: 1024,
            ..ChannelSettings::reliable_defaults()
        }
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = (payload.len() as i32).to_le_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_partial_frame_across_reads() {
        let settings = settings();
        let mut acc = FrameAccumulator::new(&settings);
        let wire = frame(b"hello");

        acc.extend(&wire[..3]);
        assert_eq!(acc.next().unwrap(), None);

        acc.extend(&wire[3..6]);
        assert_eq!(acc.next().unwrap(), None);

        acc.extend(&wire[6..]);
        assert_eq!(
            acc.next().unwrap(),
            Some(StreamFrame::Payload(b"hello".to_vec()))
        );
        assert_eq!(acc.next().unwrap(), None);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let settings = settings();
        let mut acc = FrameAccumulator::new(&settings);

        let mut wire = frame(b"one");
        wire.extend_from_slice(&frame(b"two"));
        wire.extend_from_slice(&heartbeat_bytes());
        acc.extend(&wire);

        assert_eq!(
            acc.next().unwrap(),
            Some(StreamFrame::Payload(b"one".to_vec()))
        );
        assert_eq!(
            acc.next().unwrap(),
            Some(StreamFrame::Payload(b"two".to_vec()))
        );
        assert_eq!(acc.next().unwrap(), Some(StreamFrame::Heartbeat));
        assert_eq!(acc.next().unwrap(), None);
    }

    #[test]
    fn test_control_code_classified_before_payload() {
        let settings = settings();
        let mut acc = FrameAccumulator::new(&settings);
        acc.extend(&control_bytes(-4));
        assert_eq!(acc.next().unwrap(), Some(StreamFrame::Control(-4)));
    }

    #[test]
    fn test_oversize_declared_length_rejected() {
        let settings = settings();
        let mut acc = FrameAccumulator::new(&settings);
        acc.extend(&500i32.to_le_bytes());
        assert_eq!(acc.next(), Err(DisconnectReason::PacketOverMaxSize));

        let mut acc = FrameAccumulator::new(&settings);
        acc.extend(&5000i32.to_le_bytes());
        assert_eq!(acc.next(), Err(DisconnectReason::PacketOverBufferSize));
    }

    #[test]
    fn test_datagram_length_must_match_exactly() {
        let settings = settings();

        let wire = frame(b"data");
        assert_eq!(
            parse_datagram(&wire, &settings).unwrap(),
            DatagramFrame::Payload(b"data".to_vec())
        );

        // Declared longer than the actual remainder.
        let mut wire = 10i32.to_le_bytes().to_vec();
        wire.extend_from_slice(b"data");
        assert_eq!(
            parse_datagram(&wire, &settings),
            Err(DisconnectReason::InvalidPacket)
        );

        // Declared shorter than the actual remainder.
        let mut wire = 2i32.to_le_bytes().to_vec();
        wire.extend_from_slice(b"data");
        assert_eq!(
            parse_datagram(&wire, &settings),
            Err(DisconnectReason::InvalidPacket)
        );
    }

    #[test]
    fn test_datagram_heartbeat() {
        let settings = settings();
        assert_eq!(
            parse_datagram(&heartbeat_bytes(), &settings).unwrap(),
            DatagramFrame::Heartbeat
        );
    }

    #[test]
    fn test_datagram_negative_length_rejected() {
        let settings = settings();

        // A bare control code: valid on the stream, forged in a datagram.
        assert_eq!(
            parse_datagram(&control_bytes(-1), &settings),
            Err(DisconnectReason::InvalidPacket)
        );

        // Negative length with trailing bytes.
        let mut wire = (-1i32).to_le_bytes().to_vec();
        wire.extend_from_slice(b"junk");
        assert_eq!(
            parse_datagram(&wire, &settings),
            Err(DisconnectReason::InvalidPacket)
        );
    }
}
