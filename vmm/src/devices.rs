/// Port I/O device model
///
/// Every guest `in`/`out` lands in [`PortIoBus::transfer`], which routes it to
/// the device bound to the port: the console, or a streaming data device that
/// hands out a fetched report one byte per `in`.
use crate::config::{DeviceKind, PortBinding};
use crate::console::{ConsoleInput, ConsoleOutput};
use log::debug;
use sparkler_feeds::{Feed, FeedError, FeedSource};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use thiserror::Error;

/// Transfer direction as seen from the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Guest-to-host (`out`)
    Out,
    /// Host-to-guest (`in`)
    In,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => f.write_str("out"),
            Direction::In => f.write_str("in"),
        }
    }
}

/// Data window of one port access. Only the first byte is used.
pub enum PortIo<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl PortIo<'_> {
    pub fn direction(&self) -> Direction {
        match self {
            PortIo::In(_) => Direction::In,
            PortIo::Out(_) => Direction::Out,
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("unhandled port I/O: {direction} on port 0x{port:x}")]
    UnhandledPort { port: u16, direction: Direction },

    #[error("fetching {feed} for port 0x{port:x} failed: {source}")]
    Fetch {
        port: u16,
        feed: Feed,
        #[source]
        source: FeedError,
    },

    #[error("console I/O failed: {0}")]
    Console(#[from] io::Error),

    #[error("port 0x{0:x} is bound more than once")]
    PortInUse(u16),
}

/// Console device: one byte per exit in either direction.
pub struct Console {
    output: ConsoleOutput<Box<dyn Write>>,
    input: Box<dyn ConsoleInput>,
}

impl Console {
    pub fn new(output: Box<dyn Write>, input: Box<dyn ConsoleInput>) -> Self {
        Self {
            output: ConsoleOutput::new(output),
            input,
        }
    }
}

/// Streams a NUL-terminated report to the guest one byte at a time.
///
/// While idle `buffer` is `None` and `cursor` is 0. The next `in` fetches a
/// fresh report; transferring its terminator returns the device to idle.
pub struct StreamDevice {
    feed: Feed,
    buffer: Option<Vec<u8>>,
    cursor: usize,
}

impl StreamDevice {
    pub fn new(feed: Feed) -> Self {
        Self {
            feed,
            buffer: None,
            cursor: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.buffer.is_none()
    }

    fn next_byte(&mut self, port: u16, source: &dyn FeedSource) -> Result<u8, DeviceError> {
        let buffer = match self.buffer.take() {
            Some(buffer) => buffer,
            None => {
                debug!("port 0x{:x}: fetching {}", port, self.feed);
                let report = source.fetch(&self.feed).map_err(|source| DeviceError::Fetch {
                    port,
                    feed: self.feed.clone(),
                    source,
                })?;
                self.cursor = 0;
                report.into_bytes()
            }
        };

        // Reports end in NUL, so the cursor never runs past the buffer.
        let byte = buffer.get(self.cursor).copied().unwrap_or(0);
        self.cursor += 1;
        if byte == 0 {
            self.cursor = 0;
        } else {
            self.buffer = Some(buffer);
        }
        Ok(byte)
    }
}

pub enum Device {
    Console(Console),
    Stream(StreamDevice),
}

/// Port number → device table, fixed once built.
pub struct PortIoBus {
    devices: BTreeMap<u16, Device>,
    feeds: Box<dyn FeedSource>,
}

impl PortIoBus {
    /// Build the bus from the configured port map. `console` is called once
    /// per console binding. A port may be bound only once.
    pub fn new(
        bindings: &[PortBinding],
        feeds: Box<dyn FeedSource>,
        mut console: impl FnMut() -> Console,
    ) -> Result<Self, DeviceError> {
        let mut devices = BTreeMap::new();
        for binding in bindings {
            if devices.contains_key(&binding.port) {
                return Err(DeviceError::PortInUse(binding.port));
            }
            let device = match &binding.device {
                DeviceKind::Console => Device::Console(console()),
                DeviceKind::Stream(feed) => Device::Stream(StreamDevice::new(feed.clone())),
            };
            devices.insert(binding.port, device);
        }

        Ok(Self { devices, feeds })
    }

    #[cfg(test)]
    pub fn device(&self, port: u16) -> Option<&Device> {
        self.devices.get(&port)
    }

    /// Handle one port access.
    pub fn transfer(&mut self, port: u16, io: PortIo<'_>) -> Result<(), DeviceError> {
        let direction = io.direction();
        let unhandled = DeviceError::UnhandledPort { port, direction };

        match (self.devices.get_mut(&port), io) {
            (Some(Device::Console(console)), PortIo::Out(data)) => {
                let byte = *data.first().ok_or(unhandled)?;
                console.output.write_byte(byte)?;
            }
            (Some(Device::Console(console)), PortIo::In(data)) => {
                let slot = data.first_mut().ok_or(unhandled)?;
                *slot = console.input.read_byte()?;
            }
            (Some(Device::Stream(stream)), PortIo::In(data)) => {
                let slot = data.first_mut().ok_or(unhandled)?;
                *slot = stream.next_byte(port, self.feeds.as_ref())?;
                if stream.is_idle() {
                    debug!("port 0x{:x}: {} delivered", port, stream.feed);
                }
            }
            _ => return Err(unhandled),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VmmConfig, CONSOLE_PORT, POST_PORT};
    use sparkler_feeds::Report;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Feed source returning canned text and counting calls per feed.
    struct FakeFeeds {
        text: Option<&'static str>,
        calls: Rc<RefCell<Vec<Feed>>>,
    }

    impl FeedSource for FakeFeeds {
        fn fetch(&self, feed: &Feed) -> Result<Report, FeedError> {
            self.calls.borrow_mut().push(feed.clone());
            match self.text {
                Some(text) => Report::from_text(text),
                None => Err(FeedError::Empty),
            }
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ScriptedInput {
        bytes: VecDeque<u8>,
    }

    impl ConsoleInput for ScriptedInput {
        fn read_byte(&mut self) -> io::Result<u8> {
            self.bytes
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
        }
    }

    struct Harness {
        bus: PortIoBus,
        calls: Rc<RefCell<Vec<Feed>>>,
        stdout: SharedSink,
    }

    fn harness(text: Option<&'static str>, input: &[u8]) -> Harness {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let stdout = SharedSink::default();
        let feeds = FakeFeeds {
            text,
            calls: Rc::clone(&calls),
        };
        let sink = stdout.clone();
        let input = input.to_vec();
        let bus = PortIoBus::new(&VmmConfig::default().ports, Box::new(feeds), move || {
            Console::new(
                Box::new(sink.clone()),
                Box::new(ScriptedInput {
                    bytes: input.iter().copied().collect(),
                }),
            )
        })
        .unwrap();
        Harness { bus, calls, stdout }
    }

    fn read_port(bus: &mut PortIoBus, port: u16) -> Result<u8, DeviceError> {
        let mut slot = [0xffu8; 1];
        bus.transfer(port, PortIo::In(&mut slot))?;
        Ok(slot[0])
    }

    /// Read until the terminator, returning every byte including it.
    fn read_report(bus: &mut PortIoBus, port: u16) -> Vec<u8> {
        let mut bytes = Vec::new();
        loop {
            let b = read_port(bus, port).unwrap();
            bytes.push(b);
            if b == 0 {
                return bytes;
            }
        }
    }

    #[test]
    fn test_console_out_reaches_stdout_in_order() {
        let mut h = harness(Some("unused"), &[]);
        for &b in b"Hi\n" {
            h.bus.transfer(CONSOLE_PORT, PortIo::Out(&[b])).unwrap();
        }
        assert_eq!(&*h.stdout.0.borrow(), b"Hi\n");
    }

    #[test]
    fn test_console_in_reads_one_byte() {
        let mut h = harness(Some("unused"), b"ab");
        assert_eq!(read_port(&mut h.bus, CONSOLE_PORT).unwrap(), b'a');
        assert_eq!(read_port(&mut h.bus, CONSOLE_PORT).unwrap(), b'b');
        assert!(matches!(
            read_port(&mut h.bus, CONSOLE_PORT),
            Err(DeviceError::Console(_))
        ));
    }

    #[test]
    fn test_stream_reproduces_report() {
        let mut h = harness(Some("breaking news"), &[]);
        let bytes = read_report(&mut h.bus, POST_PORT);
        assert_eq!(bytes, b"breaking news\0");
        assert_eq!(h.calls.borrow().len(), 1);
    }

    #[test]
    fn test_stream_refetches_after_terminator() {
        let mut h = harness(Some("forecast"), &[]);

        assert_eq!(read_report(&mut h.bus, 0x103), b"forecast\0");
        assert_eq!(h.calls.borrow().len(), 1);
        match h.bus.device(0x103) {
            Some(Device::Stream(s)) => assert!(s.is_idle()),
            _ => panic!("port 0x103 should be a stream device"),
        }

        // First byte of the next cycle triggers exactly one new fetch.
        assert_eq!(read_port(&mut h.bus, 0x103).unwrap(), b'f');
        assert_eq!(h.calls.borrow().len(), 2);
        assert_eq!(read_report(&mut h.bus, 0x103), b"orecast\0");
        assert_eq!(h.calls.borrow().len(), 2);
    }

    #[test]
    fn test_stream_passes_bound_arguments() {
        let mut h = harness(Some("ok"), &[]);
        read_report(&mut h.bus, 0x102);
        read_report(&mut h.bus, 0x206);
        assert_eq!(
            *h.calls.borrow(),
            vec![
                Feed::weather("New Delhi"),
                Feed::air_quality("US", "New York-Northern New Jersey-Long Island"),
            ]
        );
    }

    #[test]
    fn test_stream_devices_keep_separate_cursors() {
        let mut h = harness(Some("xyz"), &[]);
        assert_eq!(read_port(&mut h.bus, 0x101).unwrap(), b'x');
        assert_eq!(read_port(&mut h.bus, 0x201).unwrap(), b'x');
        assert_eq!(read_port(&mut h.bus, 0x101).unwrap(), b'y');
        assert_eq!(read_port(&mut h.bus, 0x201).unwrap(), b'y');
        assert_eq!(h.calls.borrow().len(), 2);
    }

    #[test]
    fn test_stream_fetch_failure_is_fatal() {
        for port in [POST_PORT, 0x104, 0x205] {
            let mut h = harness(None, &[]);
            let err = read_port(&mut h.bus, port).unwrap_err();
            assert!(matches!(err, DeviceError::Fetch { port: p, .. } if p == port));
            assert_eq!(h.calls.borrow().len(), 1);
        }
    }

    #[test]
    fn test_stream_rejects_guest_writes() {
        let mut h = harness(Some("data"), &[]);
        let err = h.bus.transfer(POST_PORT, PortIo::Out(&[b'x'])).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::UnhandledPort {
                port: POST_PORT,
                direction: Direction::Out
            }
        ));
        assert!(h.calls.borrow().is_empty());
    }

    #[test]
    fn test_unregistered_port() {
        let mut h = harness(Some("data"), &[]);
        let err = read_port(&mut h.bus, 0x60).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::UnhandledPort {
                port: 0x60,
                direction: Direction::In
            }
        ));
        let err = h.bus.transfer(0x80, PortIo::Out(&[0])).unwrap_err();
        assert_eq!(err.to_string(), "unhandled port I/O: out on port 0x80");
    }

    #[test]
    fn test_bus_rejects_port_bound_twice() {
        let bindings = [
            PortBinding {
                port: CONSOLE_PORT,
                device: DeviceKind::Console,
            },
            PortBinding {
                port: CONSOLE_PORT,
                device: DeviceKind::Stream(Feed::Post),
            },
        ];
        let feeds = FakeFeeds {
            text: None,
            calls: Rc::default(),
        };
        let result = PortIoBus::new(&bindings, Box::new(feeds), || {
            Console::new(
                Box::new(SharedSink::default()),
                Box::new(ScriptedInput {
                    bytes: VecDeque::new(),
                }),
            )
        });
        match result {
            Err(err) => assert_eq!(err.to_string(), "port 0x3f8 is bound more than once"),
            Ok(_) => panic!("duplicate binding accepted"),
        }
    }
}
