use crate::protocol::{device_info_request, MINIMUM_DELAY};
use crate::transport::{read_until_terminator, RawResponse, TimedRead, Transport};
use crate::Error;
use std::io::{self, Write};
use std::time::{Duration, Instant};

/// Synchronous serial link using the `serialport` crate.
///
/// The port is opened for every exchange and closed again when the exchange
/// returns, so several tracked devices may share one port path.
#[derive(Debug)]
pub struct SerialTransport {
    last_execution: Instant,
    delay: Duration,
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialTransport {
    pub fn new() -> Self {
        Self {
            last_execution: Instant::now(),
            delay: MINIMUM_DELAY,
        }
    }

    /// Sets the minimum delay between two requests, never below [`MINIMUM_DELAY`].
    pub fn set_delay(&mut self, delay: Duration) {
        if delay < MINIMUM_DELAY {
            log::warn!("delay {delay:?} lower minimum {MINIMUM_DELAY:?}, use minimum");
            self.delay = MINIMUM_DELAY;
        } else {
            self.delay = delay;
        }
        log::trace!("set delay to {:?}", self.delay);
    }

    fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }
}

impl TimedRead for dyn serialport::SerialPort {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout).map_err(io::Error::from)
    }
}

impl Transport for SerialTransport {
    fn send_and_receive(
        &mut self,
        endpoint: &str,
        address: u8,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<RawResponse, Error> {
        let mut serial = serialport::new(endpoint, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()?;

        // stale bytes from an earlier timed-out exchange would corrupt this one
        serial.clear(serialport::ClearBuffer::All)?;
        self.serial_await_delay();

        let tx_buffer = device_info_request(address);
        log::trace!("write bytes to {endpoint}: {tx_buffer:02X?}");
        serial.write_all(&tx_buffer)?;
        serial.flush()?;

        let response = read_until_terminator(&mut *serial, timeout)?;
        self.last_execution = Instant::now();
        log::debug!(
            "{endpoint} address {address}: {} bytes, terminated={}",
            response.bytes.len(),
            response.terminated
        );
        Ok(response)
    }
}
