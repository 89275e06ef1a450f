use crate::codec::CallArgument;
use crate::error::{AgentError, PublisherError};
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

/// Iteration state a publisher session records and hands to its backend when
/// the channel is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationContext {
    pub iteration: u32,
    pub control_iteration: bool,
    pub control_recording_iteration: bool,
    pub iteration_after_fault: bool,
}

/// The backend of one publisher channel.
///
/// A `PublisherSession` owns exactly one `Publisher` and only calls it once the
/// session's state allows the operation, so implementations do not track
/// protocol state themselves. Every method must return promptly: inbound data
/// is collected through [`Publisher::poll_input`], never by blocking.
pub trait Publisher: Send {
    /// Class name this publisher was registered under.
    fn class(&self) -> &'static str;

    fn start(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn open(&mut self, context: &IterationContext) -> Result<(), PublisherError>;

    fn close(&mut self) -> Result<(), PublisherError>;

    fn accept(&mut self) -> Result<(), PublisherError> {
        Err(PublisherError::NotSupported {
            class: self.class(),
            action: "accept",
        })
    }

    /// Invokes `method` with already-decoded arguments.
    fn call(
        &mut self,
        method: &str,
        args: &[CallArgument],
    ) -> Result<Option<Vec<u8>>, PublisherError>;

    fn set_property(&mut self, name: &str, value: &[u8]) -> Result<(), PublisherError>;

    fn get_property(&mut self, name: &str) -> Result<Option<Vec<u8>>, PublisherError>;

    fn output(&mut self, data: &[u8]) -> Result<(), PublisherError>;

    /// Hint that the engine is about to read; backends that need to arm a
    /// receive do it here.
    fn input(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    /// Appends whatever inbound bytes are available right now to `buf`, at
    /// most `limit` of them, and returns how many were appended.
    fn poll_input(&mut self, buf: &mut Vec<u8>, limit: usize) -> Result<usize, PublisherError>;

    fn get_result(&mut self) -> Result<Option<Vec<u8>>, PublisherError> {
        Ok(None)
    }

    fn set_result(&mut self, _value: Option<Vec<u8>>) -> Result<(), PublisherError> {
        Ok(())
    }
}

/// Reads an optional argument, falling back to `default` when it is absent.
pub fn parse_arg<T: FromStr>(
    args: &HashMap<String, String>,
    name: &str,
    default: Option<T>,
) -> Result<T, PublisherError>
where
    T::Err: std::fmt::Display,
{
    match args.get(name) {
        Some(text) => text
            .trim()
            .parse()
            .map_err(|e: T::Err| PublisherError::InvalidArgument {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        None => default.ok_or_else(|| PublisherError::InvalidArgument {
            name: name.to_string(),
            reason: "missing required argument".to_string(),
        }),
    }
}

/// Discards output and never produces input.
#[derive(Debug, Default)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn class(&self) -> &'static str {
        "Null"
    }

    fn open(&mut self, _context: &IterationContext) -> Result<(), PublisherError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn accept(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn call(
        &mut self,
        _method: &str,
        _args: &[CallArgument],
    ) -> Result<Option<Vec<u8>>, PublisherError> {
        Ok(None)
    }

    fn set_property(&mut self, _name: &str, _value: &[u8]) -> Result<(), PublisherError> {
        Ok(())
    }

    fn get_property(&mut self, _name: &str) -> Result<Option<Vec<u8>>, PublisherError> {
        Ok(None)
    }

    fn output(&mut self, _data: &[u8]) -> Result<(), PublisherError> {
        Ok(())
    }

    fn poll_input(&mut self, _buf: &mut Vec<u8>, _limit: usize) -> Result<usize, PublisherError> {
        Ok(0)
    }
}

/// Feeds every byte written with `output` back as input. `call` echoes the
/// concatenated argument data. Properties and the result value are kept in
/// memory.
#[derive(Debug, Default)]
pub struct LoopbackPublisher {
    pending: VecDeque<u8>,
    properties: HashMap<String, Vec<u8>>,
    result: Option<Vec<u8>>,
}

impl LoopbackPublisher {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Publisher for LoopbackPublisher {
    fn class(&self) -> &'static str {
        "Loopback"
    }

    fn open(&mut self, _context: &IterationContext) -> Result<(), PublisherError> {
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), PublisherError> {
        self.pending.clear();
        Ok(())
    }

    fn accept(&mut self) -> Result<(), PublisherError> {
        Ok(())
    }

    fn call(
        &mut self,
        _method: &str,
        args: &[CallArgument],
    ) -> Result<Option<Vec<u8>>, PublisherError> {
        let echoed: Vec<u8> = args.iter().flat_map(|a| a.data.iter().copied()).collect();
        Ok(Some(echoed))
    }

    fn set_property(&mut self, name: &str, value: &[u8]) -> Result<(), PublisherError> {
        self.properties.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn get_property(&mut self, name: &str) -> Result<Option<Vec<u8>>, PublisherError> {
        Ok(self.properties.get(name).cloned())
    }

    fn output(&mut self, data: &[u8]) -> Result<(), PublisherError> {
        self.pending.extend(data);
        Ok(())
    }

    fn poll_input(&mut self, buf: &mut Vec<u8>, limit: usize) -> Result<usize, PublisherError> {
        let take = limit.min(self.pending.len());
        buf.extend(self.pending.drain(..take));
        Ok(take)
    }

    fn get_result(&mut self) -> Result<Option<Vec<u8>>, PublisherError> {
        Ok(self.result.clone())
    }

    fn set_result(&mut self, value: Option<Vec<u8>>) -> Result<(), PublisherError> {
        self.result = value;
        Ok(())
    }
}

const TCP_READ_CHUNK: usize = 4096;
const DEFAULT_TCP_TIMEOUT_MS: u64 = 1000;

/// Connects to `Host:Port` on open and exchanges raw bytes with the peer.
pub struct TcpClientPublisher {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpClientPublisher {
    pub fn from_args(args: &HashMap<String, String>) -> Result<Self, PublisherError> {
        let host: String = parse_arg(args, "Host", None)?;
        let port: u16 = parse_arg(args, "Port", None)?;
        let timeout_ms: u64 = parse_arg(args, "Timeout", Some(DEFAULT_TCP_TIMEOUT_MS))?;
        Ok(Self {
            host,
            port,
            timeout: Duration::from_millis(timeout_ms),
            stream: None,
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream, PublisherError> {
        self.stream.as_mut().ok_or_else(|| {
            PublisherError::Io(std::io::Error::new(
                ErrorKind::NotConnected,
                "TCP connection is not open",
            ))
        })
    }
}

impl Publisher for TcpClientPublisher {
    fn class(&self) -> &'static str {
        "TcpClient"
    }

    fn open(&mut self, _context: &IterationContext) -> Result<(), PublisherError> {
        self.close()?;
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                PublisherError::Failed(format!("could not resolve {}:{}", self.host, self.port))
            })?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nonblocking(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) -> Result<(), PublisherError> {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone.
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn call(
        &mut self,
        _method: &str,
        _args: &[CallArgument],
    ) -> Result<Option<Vec<u8>>, PublisherError> {
        Err(PublisherError::NotSupported {
            class: self.class(),
            action: "call",
        })
    }

    fn set_property(&mut self, _name: &str, _value: &[u8]) -> Result<(), PublisherError> {
        Err(PublisherError::NotSupported {
            class: self.class(),
            action: "setProperty",
        })
    }

    fn get_property(&mut self, _name: &str) -> Result<Option<Vec<u8>>, PublisherError> {
        Err(PublisherError::NotSupported {
            class: self.class(),
            action: "getProperty",
        })
    }

    fn output(&mut self, data: &[u8]) -> Result<(), PublisherError> {
        let stream = self.stream()?;
        stream.set_nonblocking(false)?;
        let written = stream.write_all(data).and_then(|_| stream.flush());
        stream.set_nonblocking(true)?;
        Ok(written?)
    }

    fn poll_input(&mut self, buf: &mut Vec<u8>, limit: usize) -> Result<usize, PublisherError> {
        let stream = self.stream()?;
        let mut total = 0;
        let mut chunk = [0u8; TCP_READ_CHUNK];
        while total < limit {
            let want = (limit - total).min(TCP_READ_CHUNK);
            match stream.read(&mut chunk[..want]) {
                Ok(0) if total > 0 => break,
                Ok(0) => {
                    return Err(PublisherError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed the TCP connection",
                    )));
                }
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }
}

pub type PublisherFactory =
    Box<dyn Fn(&HashMap<String, String>) -> Result<Box<dyn Publisher>, PublisherError> + Send + Sync>;

/// Publisher classes the agent can instantiate, keyed by class name.
pub struct PublisherCatalog {
    factories: HashMap<String, PublisherFactory>,
}

impl PublisherCatalog {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, class: &str, factory: F)
    where
        F: Fn(&HashMap<String, String>) -> Result<Box<dyn Publisher>, PublisherError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(class.to_string(), Box::new(factory));
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn create(
        &self,
        class: &str,
        args: &HashMap<String, String>,
    ) -> Result<Box<dyn Publisher>, AgentError> {
        let factory = self.factories.get(class).ok_or_else(|| {
            AgentError::Collaborator(format!("Unknown publisher class '{class}'"))
        })?;
        Ok(factory(args)?)
    }
}

impl Default for PublisherCatalog {
    fn default() -> Self {
        let mut catalog = Self::empty();
        catalog.register("Null", |_| Ok(Box::new(NullPublisher)));
        catalog.register("Loopback", |_| Ok(Box::new(LoopbackPublisher::new())));
        catalog.register("TcpClient", |args| {
            Ok(Box::new(TcpClientPublisher::from_args(args)?))
        });
        catalog
    }
}
