use crate::channel::Channel;
use crate::dispatch::Request;
use crate::shared::{lock, read, write, ConnId, ErrorKind, GroupId, NetError, NetResult};
use hashbrown::HashMap;
use marline::logging::{self, Logger};
use marline::ticker::Ticker;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

/// Percentage roll ceiling and the compaction threshold: a roll at or under
/// the threshold shrinks the member map after a departure.
const FULL_PERCENT: u32 = 100;
const REBUILD_THRESHOLD: u32 = 30;

/// Read rate used when the caller does not supply one; matches the default
/// bucket read rate.
const DEFAULT_READ_RATE: Duration = Duration::from_millis(200);

pub type GroupReadCallback =
    Arc<dyn Fn(GroupId, Arc<Channel>, Request) -> NetResult<()> + Send + Sync>;
pub type GroupDisconnectCallback = Arc<dyn Fn(Arc<Channel>) + Send + Sync>;

/// Application-created broadcast scope over a subset of connections. Members
/// are held weakly: a channel closed elsewhere simply drops out on the next
/// tick. The group runs its own read ticker and is not a substitute for the
/// always-on bucket partitioning.
pub struct Group {
    core: Arc<GroupCore>,
    read_ticker: Mutex<Option<Ticker>>,
}

struct GroupCore {
    group_id: GroupId,
    err_msg_id: AtomicU32,
    conns: RwLock<HashMap<ConnId, Weak<Channel>>>,
    cb_read: RwLock<Option<GroupReadCallback>>,
    cb_disconnected: RwLock<Option<GroupDisconnectCallback>>,
    log: Logger,
}

impl Group {
    pub fn new<'a, L, R>(group_id: GroupId, read_rate: R, log: L) -> Group
    where
        L: Into<Option<&'a Logger>>,
        R: Into<Option<Duration>>,
    {
        let read_rate = read_rate.into().unwrap_or(DEFAULT_READ_RATE);
        let group_log = match log.into() {
            Some(parent) => parent.new(logging::o!("group" => group_id)),
            None => logging::discard(),
        };

        let core = Arc::new(GroupCore {
            group_id,
            err_msg_id: AtomicU32::new(0),
            conns: RwLock::new(HashMap::new()),
            cb_read: RwLock::new(None),
            cb_disconnected: RwLock::new(None),
            log: group_log,
        });

        let tick_core = core.clone();
        let read_ticker = Ticker::spawn(
            &format!("group-{}-read", group_id),
            read_rate,
            core.log.clone(),
            move || tick_core.read_tick(),
        );

        Group {
            core,
            read_ticker: Mutex::new(Some(read_ticker)),
        }
    }

    #[inline]
    pub fn get_group_id(&self) -> GroupId {
        self.core.group_id
    }

    pub fn len(&self) -> usize {
        read(&self.core.conns).len()
    }

    /// Message id used to report read errors back to the offending client;
    /// 0 disables the reply.
    pub fn set_err_msg_id(&self, msg_id: u32) {
        self.core.err_msg_id.store(msg_id, Ordering::Release);
    }

    pub fn set_cb_for_read_message(&self, cb: GroupReadCallback) {
        *write(&self.core.cb_read) = Some(cb);
    }

    pub fn set_cb_for_disconnect(&self, cb: GroupDisconnectCallback) {
        *write(&self.core.cb_disconnected) = Some(cb);
    }

    /// Adds a channel to the scope and stamps its group id.
    pub fn join(&self, conn: &Arc<Channel>) -> NetResult<()> {
        if conn.get_conn_id() <= 0 {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        conn.set_group_id(self.core.group_id);
        write(&self.core.conns).insert(conn.get_conn_id(), Arc::downgrade(conn));

        Ok(())
    }

    /// Removes channels from the scope, clearing their group ids. Departures
    /// trigger the randomized map compaction.
    pub fn quit(&self, conns: &[Arc<Channel>]) -> NetResult<()> {
        if conns.is_empty() {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        let mut members = write(&self.core.conns);
        for conn in conns {
            conn.set_group_id(0);
            members.remove(&conn.get_conn_id());
        }
        GroupCore::maybe_compact(&mut members);

        Ok(())
    }

    /// Broadcasts one frame to every live member. Per-member failures are
    /// logged and the fan-out continues.
    pub fn send_message(&self, msg_id: u32, data: &[u8]) -> NetResult<()> {
        if msg_id == 0 || data.is_empty() {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        for conn in self.core.live_members() {
            if let Err(err) = conn.send_message(msg_id, data) {
                logging::warn!(self.core.log, "group send failed";
                               "context" => "send_message",
                               "conn_id" => conn.get_conn_id(),
                               "err" => format!("{:?}", err));
            }
        }

        Ok(())
    }

    /// Tears the scope down: stops the ticker and forgets every member after
    /// clearing its group id. The channels themselves stay open; they belong
    /// to their buckets.
    pub fn clear(&self) {
        if let Some(ticker) = lock(&self.read_ticker).take() {
            ticker.quit();
        }

        let mut members = write(&self.core.conns);
        for conn in members.values().filter_map(Weak::upgrade) {
            conn.set_group_id(0);
        }
        *members = HashMap::new();

        logging::debug!(self.core.log, "group cleared"; "context" => "clear");
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        self.clear();
    }
}

impl GroupCore {
    /// Live members, dropping entries whose channel has gone away.
    fn live_members(&self) -> Vec<Arc<Channel>> {
        let mut dead = Vec::new();
        let live: Vec<Arc<Channel>> = {
            let members = read(&self.conns);
            members
                .iter()
                .filter_map(|(&conn_id, weak)| match weak.upgrade() {
                    Some(conn) => Some(conn),
                    None => {
                        dead.push(conn_id);
                        None
                    }
                })
                .collect()
        };

        if !dead.is_empty() {
            let mut members = write(&self.conns);
            for conn_id in &dead {
                members.remove(conn_id);
            }
            Self::maybe_compact(&mut members);
        }

        live
    }

    /// One pass over the scope: at most one frame per member. Transport-fatal
    /// reads close and drop the member; refused frames are answered with the
    /// configured error message id and the member stays.
    fn read_tick(&self) {
        for conn in self.live_members() {
            match conn.read_message() {
                Ok(message) => {
                    let cb = read(&self.cb_read).clone();
                    if let Some(cb) = cb {
                        let req = Request::new(conn.clone(), message);
                        if let Err(err) = cb(self.group_id, conn.clone(), req) {
                            logging::warn!(self.log, "read callback failed";
                                           "context" => "read_tick",
                                           "conn_id" => conn.get_conn_id(),
                                           "err" => format!("{:?}", err));
                        }
                    }
                }
                Err(NetError::Wait) => (),
                Err(err @ NetError::Fatal(ErrorKind::FrameTooLarge))
                | Err(err @ NetError::Fatal(ErrorKind::Codec)) => {
                    logging::warn!(self.log, "member sent a refused frame";
                                   "context" => "read_tick",
                                   "conn_id" => conn.get_conn_id(),
                                   "err" => format!("{:?}", err));

                    let err_msg_id = self.err_msg_id.load(Ordering::Acquire);
                    if err_msg_id != 0 {
                        drop(conn.send_message(err_msg_id, format!("{:?}", err).as_bytes()));
                    }
                }
                Err(err) => {
                    logging::debug!(self.log, "member read failed, dropping";
                                    "context" => "read_tick",
                                    "conn_id" => conn.get_conn_id(),
                                    "err" => format!("{:?}", err));
                    self.close_conn(&conn);
                }
            }
        }
    }

    fn close_conn(&self, conn: &Arc<Channel>) {
        if conn.quit() {
            if let Some(cb) = read(&self.cb_disconnected).clone() {
                cb(conn.clone());
            }
        }

        let mut members = write(&self.conns);
        members.remove(&conn.get_conn_id());
        Self::maybe_compact(&mut members);
    }

    /// Randomized compaction: an empty map always shrinks, otherwise a
    /// percentage roll at or under the threshold does.
    fn maybe_compact(members: &mut HashMap<ConnId, Weak<Channel>>) {
        if members.is_empty() || rand::thread_rng().gen_range(0..FULL_PERCENT) <= REBUILD_THRESHOLD
        {
            members.shrink_to_fit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Codec, Message, HEADER_SIZE};
    use mio::net::TcpStream;
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener, TcpStream as StdTcpStream};
    use std::thread;

    const MAX_PACK: u32 = 64;
    const TICK: Duration = Duration::from_millis(10);

    fn codec() -> Codec {
        Codec::new(true, MAX_PACK)
    }

    fn socket_pair(conn_id: ConnId) -> (Arc<Channel>, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let conn = Arc::new(Channel::new(
            conn_id,
            TcpStream::from_std(accepted),
            peer,
            codec(),
            Duration::from_secs(1),
            None,
        ));

        (conn, client)
    }

    fn read_frame(client: &mut StdTcpStream) -> Message {
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let mut header = [0u8; HEADER_SIZE];
        client.read_exact(&mut header).unwrap();
        let mut message = codec().unpack(&header).unwrap();

        let mut data = vec![0u8; message.get_len() as usize];
        client.read_exact(&mut data).unwrap();
        message.set_data(data);
        message
    }

    fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn test_join_stamps_the_group_id() {
        let group = Group::new(7, TICK, None);
        let (conn, _client) = socket_pair(1);

        group.join(&conn).unwrap();

        assert_eq!(conn.get_group_id(), 7);
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn test_quit_clears_the_group_id() {
        let group = Group::new(7, TICK, None);
        let (conn, _client) = socket_pair(1);
        group.join(&conn).unwrap();

        group.quit(&[conn.clone()]).unwrap();

        assert_eq!(conn.get_group_id(), 0);
        assert_eq!(group.len(), 0);
        assert_eq!(
            group.quit(&[]).unwrap_err(),
            NetError::Fatal(ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn test_send_message_broadcasts_to_members() {
        let group = Group::new(7, TICK, None);
        let (conn_a, mut client_a) = socket_pair(1);
        let (conn_b, mut client_b) = socket_pair(2);
        group.join(&conn_a).unwrap();
        group.join(&conn_b).unwrap();

        group.send_message(3, b"news").unwrap();

        assert_eq!(read_frame(&mut client_a).get_data(), b"news");
        assert_eq!(read_frame(&mut client_b).get_data(), b"news");
    }

    #[test]
    fn test_send_message_validates_arguments() {
        let group = Group::new(7, TICK, None);

        assert_eq!(
            group.send_message(0, b"x").unwrap_err(),
            NetError::Fatal(ErrorKind::InvalidArgument)
        );
        assert_eq!(
            group.send_message(1, b"").unwrap_err(),
            NetError::Fatal(ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn test_dead_members_drop_out() {
        let group = Group::new(7, TICK, None);
        let (conn, _client) = socket_pair(1);
        group.join(&conn).unwrap();

        drop(conn);

        group.send_message(1, b"x").unwrap();
        assert_eq!(group.len(), 0);
    }

    #[test]
    fn test_read_tick_feeds_the_group_callback() {
        let group = Group::new(7, TICK, None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        group.set_cb_for_read_message(Arc::new(move |group_id, conn, req| {
            sink.lock()
                .unwrap()
                .push((group_id, conn.get_conn_id(), req.get_message().get_id()));
            Ok(())
        }));

        let (conn, mut client) = socket_pair(1);
        group.join(&conn).unwrap();

        let bytes = codec().pack(&Message::new(5, b"hi".to_vec())).unwrap();
        client.write_all(&bytes).unwrap();

        wait_until("group callback", || !seen.lock().unwrap().is_empty());
        assert_eq!(seen.lock().unwrap()[0], (7, 1, 5));
    }

    #[test]
    fn test_refused_frame_answered_with_err_msg_id() {
        let group = Group::new(7, TICK, None);
        group.set_err_msg_id(99);

        let (conn, mut client) = socket_pair(1);
        group.join(&conn).unwrap();

        let oversize = Codec::new(true, 2048)
            .pack(&Message::new(1, vec![0; MAX_PACK as usize + 1]))
            .unwrap();
        client.write_all(&oversize).unwrap();

        let reply = read_frame(&mut client);
        assert_eq!(reply.get_id(), 99);
        // The offender stays a member.
        assert_eq!(group.len(), 1);
        assert_eq!(conn.get_state(), crate::channel::ChannelState::Active);
    }

    #[test]
    fn test_peer_close_drops_the_member_and_fires_disconnect() {
        let group = Group::new(7, TICK, None);
        let fired = Arc::new(Mutex::new(0usize));
        let counter = fired.clone();
        group.set_cb_for_disconnect(Arc::new(move |_conn| {
            *counter.lock().unwrap() += 1;
        }));

        let (conn, client) = socket_pair(1);
        group.join(&conn).unwrap();

        drop(client);

        wait_until("member drop", || group.len() == 0);
        assert_eq!(*fired.lock().unwrap(), 1);
        assert_eq!(conn.get_state(), crate::channel::ChannelState::Closed);
    }

    #[test]
    fn test_clear_resets_membership() {
        let group = Group::new(7, TICK, None);
        let (conn, _client) = socket_pair(1);
        group.join(&conn).unwrap();

        group.clear();

        assert_eq!(group.len(), 0);
        assert_eq!(conn.get_group_id(), 0);
        assert_eq!(conn.get_state(), crate::channel::ChannelState::Active);
    }
}
