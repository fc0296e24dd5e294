use crate::protocol::{START_BYTE, TERMINATOR};
use crate::Error;
use std::io::{self, Read};
use std::time::{Duration, Instant};

const RX_CHUNK_LENGTH: usize = 64;
const RX_BUFFER_CAPACITY: usize = 256;

/// Bytes read back for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub bytes: Vec<u8>,
    /// `true` when the terminator was seen before the deadline.
    pub terminated: bool,
}

impl RawResponse {
    pub fn complete(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            terminated: true,
        }
    }

    pub fn partial(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            terminated: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The ASCII hex payload between the `~` marker and the terminator.
    ///
    /// Returns `None` for unterminated or too short responses. When no marker
    /// is present the whole pre-terminator buffer is used.
    pub fn payload(&self) -> Option<String> {
        if !self.terminated || self.bytes.len() < 3 {
            return None;
        }
        let end = self.bytes.len() - 1;
        let start = match self.bytes[..end].iter().position(|b| *b == START_BYTE) {
            Some(marker) => marker + 1,
            None => 0,
        };
        Some(String::from_utf8_lossy(&self.bytes[start..end]).into_owned())
    }
}

/// One request/response exchange on a point-to-point link.
///
/// Implementations own the link exclusively for the duration of the call
/// and release it before returning.
pub trait Transport {
    fn send_and_receive(
        &mut self,
        endpoint: &str,
        address: u8,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<RawResponse, Error>;
}

/// A byte source whose blocking read timeout can be changed between reads.
pub trait TimedRead: Read {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

/// Reads until the terminator or until `timeout` elapsed.
///
/// Bytes arriving after the terminator in the same read are discarded. A
/// timeout is not an error, the bytes received so far are returned as a
/// partial response.
pub fn read_until_terminator<R: TimedRead + ?Sized>(
    reader: &mut R,
    timeout: Duration,
) -> io::Result<RawResponse> {
    let deadline = Instant::now() + timeout;
    let mut rx_buffer = Vec::with_capacity(RX_BUFFER_CAPACITY);
    let mut chunk = [0u8; RX_CHUNK_LENGTH];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            log::trace!("deadline reached after {} bytes", rx_buffer.len());
            return Ok(RawResponse::partial(rx_buffer));
        }
        // a single blocking read must not outlive the deadline
        reader.set_read_timeout(remaining)?;
        match reader.read(&mut chunk) {
            Ok(0) => {
                log::trace!("end of stream after {} bytes", rx_buffer.len());
                return Ok(RawResponse::partial(rx_buffer));
            }
            Ok(received) => {
                let part = &chunk[..received];
                if let Some(end) = part.iter().position(|b| *b == TERMINATOR) {
                    rx_buffer.extend_from_slice(&part[..=end]);
                    let discarded = received - end - 1;
                    if discarded > 0 {
                        log::warn!("Discarding {} bytes after terminator", discarded);
                    }
                    log::trace!("receive_bytes: {:02X?}", rx_buffer);
                    return Ok(RawResponse::complete(rx_buffer));
                }
                rx_buffer.extend_from_slice(part);
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                log::trace!("read timed out after {} bytes", rx_buffer.len());
                return Ok(RawResponse::partial(rx_buffer));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out one scripted chunk per read, then times out.
    struct ScriptedReader {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ScriptedReader {
        fn new(chunks: &[&[u8]]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_vec()).collect(),
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "timed out")),
            }
        }
    }

    impl TimedRead for ScriptedReader {
        fn set_read_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }
    }

    /// Drips one non-terminator byte every `interval`, honouring the read timeout.
    struct DrippingReader {
        interval: Duration,
        read_timeout: Duration,
        timeouts: Vec<Duration>,
    }

    impl Read for DrippingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.read_timeout < self.interval {
                std::thread::sleep(self.read_timeout);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
            }
            std::thread::sleep(self.interval);
            buf[0] = b'A';
            Ok(1)
        }
    }

    impl TimedRead for DrippingReader {
        fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
            self.read_timeout = timeout;
            self.timeouts.push(timeout);
            Ok(())
        }
    }

    #[test]
    fn stops_at_terminator_across_chunks() {
        let mut reader = ScriptedReader::new(&[b"~2201", b"4A00\r"]);
        let response = read_until_terminator(&mut reader, Duration::from_secs(1)).unwrap();
        assert!(response.terminated);
        assert_eq!(response.bytes, b"~22014A00\r");
        assert_eq!(response.payload().as_deref(), Some("22014A00"));
    }

    #[test]
    fn bytes_after_terminator_are_dropped() {
        let mut reader = ScriptedReader::new(&[b"~AB\r~CD\r"]);
        let response = read_until_terminator(&mut reader, Duration::from_secs(1)).unwrap();
        assert_eq!(response.bytes, b"~AB\r");
        assert_eq!(response.payload().as_deref(), Some("AB"));
    }

    #[test]
    fn silence_is_an_empty_partial_response() {
        let mut reader = ScriptedReader::new(&[]);
        let response = read_until_terminator(&mut reader, Duration::from_secs(1)).unwrap();
        assert!(!response.terminated);
        assert!(response.is_empty());
        assert_eq!(response.payload(), None);
    }

    #[test]
    fn unterminated_bytes_are_partial() {
        let mut reader = ScriptedReader::new(&[b"~2201"]);
        let response = read_until_terminator(&mut reader, Duration::from_secs(1)).unwrap();
        assert!(!response.terminated);
        assert_eq!(response.bytes.len(), 5);
        assert_eq!(response.payload(), None);
    }

    #[test]
    fn read_timeout_shrinks_towards_the_deadline() {
        let timeout = Duration::from_millis(100);
        let mut reader = DrippingReader {
            interval: Duration::from_millis(40),
            read_timeout: timeout,
            timeouts: Vec::new(),
        };
        let started = Instant::now();
        let response = read_until_terminator(&mut reader, timeout).unwrap();
        assert!(started.elapsed() < 2 * timeout);
        assert!(!response.terminated);
        assert!(response.bytes.iter().all(|b| *b == b'A'));
        assert!(reader.timeouts.len() >= 2);
        assert!(reader.timeouts.iter().all(|t| *t <= timeout));
        assert!(reader.timeouts.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn payload_without_marker_uses_whole_buffer() {
        let response = RawResponse::complete(b"22014A\r".to_vec());
        assert_eq!(response.payload().as_deref(), Some("22014A"));
    }

    #[test]
    fn other_io_errors_propagate() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            }
        }
        impl TimedRead for Broken {
            fn set_read_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
                Ok(())
            }
        }
        assert!(read_until_terminator(&mut Broken, Duration::from_secs(1)).is_err());
    }
}
