use crate::buffer::Buffer;
use crate::frame::{Codec, Message, HEADER_SIZE};
use crate::shared::{lock, read, write, ConnId, ErrorKind, GroupId, NetError, NetResult};
use hashbrown::{HashMap, HashSet};
use marline::logging::{self, Logger};
use marline::time::timestamp_secs;
use mio::net::TcpStream;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// A channel starts `Active` and ends `Closed`; `Closed` is terminal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Active,
    Closed,
}

#[derive(Debug)]
struct ReadState {
    buf: Buffer,
    eof: bool,
}

/// A single client connection: the non-blocking socket, its framing state and
/// the user-attached metadata. Shared via `Arc` between the owning bucket,
/// the registry and at most one group.
#[derive(Debug)]
pub struct Channel {
    id: ConnId,
    stream: TcpStream,
    peer: SocketAddr,
    codec: Codec,
    write_deadline: Duration,

    closed: AtomicBool,
    active_time: AtomicI64,
    group_id: AtomicI64,

    // Framing state for the single reader; writes serialize on `write_guard`.
    read_state: Mutex<ReadState>,
    write_guard: Mutex<()>,

    tags: RwLock<HashSet<String>>,
    properties: RwLock<HashMap<String, serde_json::Value>>,

    log: Logger,
}

impl Channel {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        id: ConnId,
        stream: TcpStream,
        peer: SocketAddr,
        codec: Codec,
        write_deadline: Duration,
        log: L,
    ) -> Channel {
        let channel_log = match log.into() {
            Some(parent) => parent.new(logging::o!("conn_id" => id)),
            None => logging::discard(),
        };

        // Room for one maximal frame; an oversize header is still always
        // readable because the bound exceeds the header size.
        let read_capacity = HEADER_SIZE + codec.max_pack_size() as usize;

        Channel {
            id,
            stream,
            peer,
            codec,
            write_deadline,
            closed: AtomicBool::new(false),
            active_time: AtomicI64::new(timestamp_secs()),
            group_id: AtomicI64::new(0),
            read_state: Mutex::new(ReadState {
                buf: Buffer::new(read_capacity),
                eof: false,
            }),
            write_guard: Mutex::new(()),
            tags: RwLock::new(HashSet::new()),
            properties: RwLock::new(HashMap::new()),
            log: channel_log,
        }
    }

    #[inline]
    pub fn get_conn_id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn get_remote_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Unix timestamp of the last successful read or write.
    #[inline]
    pub fn get_active_time(&self) -> i64 {
        self.active_time.load(Ordering::Acquire)
    }

    #[inline]
    pub fn get_state(&self) -> ChannelState {
        match self.closed.load(Ordering::Acquire) {
            true => ChannelState::Closed,
            false => ChannelState::Active,
        }
    }

    #[inline]
    pub fn get_group_id(&self) -> GroupId {
        self.group_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_group_id(&self, group_id: GroupId) {
        self.group_id.store(group_id, Ordering::Release)
    }

    /// Packs a frame with `kind` 0 and writes it out. Fails on a zero message
    /// id, an empty payload, a closed channel, or a transport error; a write
    /// that cannot complete within the deadline fails with a timeout.
    #[inline]
    pub fn send_message(&self, msg_id: u32, data: &[u8]) -> NetResult<()> {
        self.send_frame(&Message::new(msg_id, data.to_vec()))
    }

    /// Writes a caller-built frame, carrying whatever `kind` it was given.
    pub fn send_frame(&self, message: &Message) -> NetResult<()> {
        if message.get_id() == 0 || message.get_data().is_empty() {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Fatal(ErrorKind::Closed));
        }

        let bytes = self.codec.pack(message)?;

        {
            let _guard = lock(&self.write_guard);
            self.write_all_deadline(&bytes)?;
        }

        self.touch();

        logging::trace!(self.log, "frame sent";
                        "context" => "send",
                        "msg_id" => message.get_id(),
                        "len" => message.get_len());

        Ok(())
    }

    /// Attempts to extract exactly one frame. Pulls whatever the transport
    /// has buffered, then parses the header and, once `len` payload bytes are
    /// available, returns the complete message. `Wait` means no full frame
    /// yet; EOF with nothing extractable is a fatal transport error. A header
    /// the codec refuses is consumed, so the caller decides whether the (now
    /// desynchronized) stream is still worth keeping.
    pub fn read_message(&self) -> NetResult<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Fatal(ErrorKind::Closed));
        }

        let mut state = lock(&self.read_state);

        if !state.eof {
            let (_, eof) = state.buf.ingress(&self.stream)?;
            state.eof = eof;
        }

        match self.extract_frame(&mut state) {
            Err(NetError::Wait) if state.eof => {
                Err(NetError::Fatal(ErrorKind::Io(io::ErrorKind::UnexpectedEof)))
            }
            other => other,
        }
    }

    /// Idempotent close: shuts the socket down in both directions and clears
    /// the group membership. Returns true only for the call that actually
    /// performed the close.
    pub fn quit(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.group_id.store(0, Ordering::Release);

        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            logging::trace!(self.log, "socket shutdown failed";
                            "context" => "quit",
                            "err" => format!("{:?}", err));
        }

        logging::debug!(self.log, "channel closed"; "context" => "quit", "peer" => format!("{}", self.peer));
        true
    }

    pub fn add_tag(&self, tag: &str) -> NetResult<()> {
        if tag.is_empty() {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        write(&self.tags).insert(tag.to_owned());
        Ok(())
    }

    pub fn remove_tag(&self, tag: &str) {
        write(&self.tags).remove(tag);
    }

    #[inline]
    pub fn has_tag(&self, tag: &str) -> bool {
        read(&self.tags).contains(tag)
    }

    /// True when the channel carries at least one of the supplied tags.
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        let owned = read(&self.tags);
        tags.iter().any(|tag| owned.contains(tag))
    }

    pub fn get_tags(&self) -> Vec<String> {
        read(&self.tags).iter().cloned().collect()
    }

    pub fn set_property(&self, key: &str, value: serde_json::Value) -> NetResult<()> {
        if key.is_empty() {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        write(&self.properties).insert(key.to_owned(), value);
        Ok(())
    }

    pub fn get_property(&self, key: &str) -> NetResult<serde_json::Value> {
        read(&self.properties)
            .get(key)
            .cloned()
            .ok_or(NetError::Fatal(ErrorKind::NotFound))
    }

    pub fn remove_property(&self, key: &str) {
        write(&self.properties).remove(key);
    }

    #[inline]
    fn touch(&self) {
        self.active_time.store(timestamp_secs(), Ordering::Release);
    }

    fn extract_frame(&self, state: &mut ReadState) -> NetResult<Message> {
        if state.buf.len() < HEADER_SIZE {
            return Err(NetError::Wait);
        }

        let parsed = {
            let header = &state.buf.read_slice()[..HEADER_SIZE];
            self.codec.unpack(header)
        };

        let mut message = match parsed {
            Ok(message) => message,
            Err(err) => {
                state.buf.advance(HEADER_SIZE);
                logging::debug!(self.log, "header refused";
                                "context" => "read",
                                "err" => format!("{:?}", err));
                return Err(err);
            }
        };

        let total = HEADER_SIZE + message.get_len() as usize;
        if state.buf.len() < total {
            return Err(NetError::Wait);
        }

        let data = state.buf.read_slice()[HEADER_SIZE..total].to_vec();
        state.buf.advance(total);
        message.set_data(data);

        self.touch();

        logging::trace!(self.log, "frame received";
                        "context" => "read",
                        "msg_id" => message.get_id(),
                        "len" => message.get_len());

        Ok(message)
    }

    /// Writes the whole buffer, spinning past would-block until the deadline
    /// elapses. A zero deadline waits indefinitely.
    fn write_all_deadline(&self, mut buf: &[u8]) -> NetResult<()> {
        let start = Instant::now();

        while !buf.is_empty() {
            match (&self.stream).write(buf) {
                Ok(0) => return Err(NetError::Fatal(ErrorKind::Io(io::ErrorKind::WriteZero))),
                Ok(count) => buf = &buf[count..],
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if self.write_deadline > Duration::from_secs(0)
                        && start.elapsed() >= self.write_deadline
                    {
                        return Err(NetError::Fatal(ErrorKind::Io(io::ErrorKind::TimedOut)));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(NetError::Fatal(ErrorKind::Io(err.kind()))),
            }
        }

        Ok(())
    }
}
