use crate::core::host::{Dispatcher, ServerIdentity};
use crate::core::rpc::{self, PduType, RequestEvent, RpcFramer};
use crate::core::ClientStore;
use crate::model::error::{Error, KmsError, KmsErrorKind, KmsResult};
use crate::model::link::Link;
use log::{debug, info, warn};
use std::io::ErrorKind as IoErrorKind;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1688;

/// Static server configuration, assembled by the embedding
/// binary and immutable afterwards
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening addresses; the default wildcard v6 bind is
    /// dual stack where the OS allows it
    pub bind_addrs: Vec<SocketAddr>,
    /// Operator EPID override; synthesized per application
    /// family when absent
    pub epid: Option<String>,
    /// Operator hardware id override; drawn once per process
    /// when absent
    pub hwid: Option<[u8; 8]>,
    /// Client count reported to activating clients
    pub client_count: u32,
    /// Upper bound on the reported count
    pub max_clients: u32,
    /// License count field of synthesized EPIDs
    pub license_count: u32,
    /// Language id of synthesized EPIDs
    pub language: u32,
    /// Minutes between activation attempts told to the client
    pub activation_interval: u32,
    /// Minutes between renewal attempts told to the client
    pub renewal_interval: u32,
    /// Budget for a connection with no PDU in flight
    pub idle_timeout: Duration,
    /// Budget for the remainder of a partially received PDU
    pub read_timeout: Duration,
    /// Connection high water mark; above it new connections
    /// are refused at accept time
    pub high_water: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addrs: vec![SocketAddr::from((
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                DEFAULT_PORT,
            ))],
            epid: None,
            hwid: None,
            client_count: 50,
            max_clients: 1000,
            license_count: 100,
            language: 1033,
            activation_interval: 120,
            renewal_interval: 10080,
            idle_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(10),
            high_water: 256,
        }
    }
}

/// Automata of one client association:
/// `Binding` until a Bind is answered, then `Bound` for any
/// number of requests, `Closed` on error or disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Binding,
    Bound,
    Closed,
}

/// Protocol state of one accepted connection, independent of
/// the transport that feeds it
pub struct Connection {
    framer: RpcFramer,
    state: ConnectionState,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Connection {
            framer: RpcFramer::new(),
            state: ConnectionState::Binding,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Process one complete PDU and return the bytes to send
    /// back, if any. An `Err` means the connection is beyond
    /// recovery and must be closed without a reply.
    pub fn process_pdu<S: ClientStore>(
        &mut self,
        raw: &[u8],
        dispatcher: &Dispatcher<S>,
    ) -> KmsResult<Option<Vec<u8>>> {
        let header = rpc::decode_header(raw)?;
        let body = &raw[rpc::RPC_HEADER_SIZE..];

        // no authentication is ever negotiated on this interface
        if header.auth_length != 0 {
            return Ok(Some(self.framer.fault(header.call_id, rpc::NCA_PROTO_ERROR)?));
        }

        match (self.state, header.ptype) {
            (ConnectionState::Binding, PduType::Bind) => {
                let ack = self.framer.handle_bind(&header, body)?;
                self.state = ConnectionState::Bound;
                Ok(Some(ack))
            }
            (ConnectionState::Bound, PduType::Request) => {
                match self.framer.handle_request(&header, body) {
                    Ok(RequestEvent::Pending) => Ok(None),
                    Ok(RequestEvent::Complete { call_id, payload }) => {
                        match dispatcher.dispatch(&payload) {
                            Ok(response) => Ok(Some(self.framer.response(call_id, &response)?)),
                            Err(e) => self.reply_error(call_id, e),
                        }
                    }
                    Err(e) => self.reply_error(header.call_id, e),
                }
            }
            (state, ptype) => {
                self.state = ConnectionState::Closed;
                Err(Error::KmsError(KmsError::new(
                    KmsErrorKind::InvalidAutomata,
                    &format!("unexpected {:?} PDU in state {:?}", ptype, state),
                )))
            }
        }
    }

    fn reply_error(&mut self, call_id: u32, error: Error) -> KmsResult<Option<Vec<u8>>> {
        match error.kind() {
            // silent close, the peer must not learn why
            KmsErrorKind::AuthFailure | KmsErrorKind::DecryptMismatch => {
                info!("closing connection: {:?}", error);
                self.state = ConnectionState::Closed;
                Ok(None)
            }
            KmsErrorKind::UnknownOpnum => {
                Ok(Some(self.framer.fault(call_id, rpc::NCA_OP_RNG_ERROR)?))
            }
            KmsErrorKind::UnknownVersion
            | KmsErrorKind::ShortBuffer
            | KmsErrorKind::MalformedField
            | KmsErrorKind::InvalidData
            | KmsErrorKind::InvalidConst
            | KmsErrorKind::InvalidSize => {
                Ok(Some(self.framer.fault(call_id, rpc::NCA_PROTO_ERROR)?))
            }
            _ => {
                self.state = ConnectionState::Closed;
                Err(error)
            }
        }
    }
}

/// The KMS host: one acceptor per bound address, one handler
/// thread per live connection
pub struct Server<S> {
    config: Arc<ServerConfig>,
    dispatcher: Arc<Dispatcher<S>>,
}

impl<S: ClientStore + Send + Sync + 'static> Server<S> {
    pub fn new(config: ServerConfig, store: S) -> Self {
        let identity = ServerIdentity::new(&config);
        Server {
            config: Arc::new(config),
            dispatcher: Arc::new(Dispatcher::new(identity, store)),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<S>> {
        &self.dispatcher
    }

    /// Bind every configured address and serve until the
    /// process is stopped
    pub fn run(&self) -> KmsResult<()> {
        let active = Arc::new(AtomicUsize::new(0));
        let mut acceptors = Vec::new();
        for addr in &self.config.bind_addrs {
            let listener = TcpListener::bind(addr)?;
            info!("listening on {}", addr);
            let config = self.config.clone();
            let dispatcher = self.dispatcher.clone();
            let active = active.clone();
            acceptors.push(thread::spawn(move || {
                accept_loop(listener, config, dispatcher, active)
            }));
        }
        for acceptor in acceptors {
            let _ = acceptor.join();
        }
        Ok(())
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn accept_loop<S: ClientStore + Send + Sync + 'static>(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    dispatcher: Arc<Dispatcher<S>>,
    active: Arc<AtomicUsize>,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if active.load(Ordering::SeqCst) >= config.high_water {
                    // refuse at accept time, live connections
                    // are unaffected
                    warn!("refusing {}: connection high water mark reached", peer);
                    drop(stream);
                    continue;
                }
                active.fetch_add(1, Ordering::SeqCst);
                let guard = ActiveGuard(active.clone());
                let config = config.clone();
                let dispatcher = dispatcher.clone();
                thread::spawn(move || {
                    let _guard = guard;
                    if let Err(e) = handle_connection(stream, peer, &config, &dispatcher) {
                        debug!("connection {} ended with {:?}", peer, e);
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {}", e);
            }
        }
    }
}

fn is_timeout(kind: IoErrorKind) -> bool {
    matches!(kind, IoErrorKind::WouldBlock | IoErrorKind::TimedOut)
}

fn handle_connection<S: ClientStore>(
    stream: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    dispatcher: &Dispatcher<S>,
) -> KmsResult<()> {
    debug!("connection from {}", peer);
    stream.set_write_timeout(Some(config.read_timeout))?;
    let mut link = Link::new(stream);
    let mut connection = Connection::new();

    while connection.state() != ConnectionState::Closed {
        // idle budget while waiting for the next PDU to start
        link.get_ref().set_read_timeout(Some(config.idle_timeout))?;
        let mut pdu = match link.read(rpc::RPC_HEADER_SIZE) {
            Ok(raw) => raw,
            Err(Error::KmsError(ref e)) if e.kind() == KmsErrorKind::ShortBuffer => {
                debug!("{} disconnected", peer);
                break;
            }
            Err(Error::Io(ref e)) if is_timeout(e.kind()) => {
                debug!("{} idle timeout", peer);
                break;
            }
            Err(e) => return Err(e),
        };

        // tighter budget for the rest of a started PDU
        link.get_ref().set_read_timeout(Some(config.read_timeout))?;
        let size = rpc::pdu_size(&pdu)?;
        if size < rpc::RPC_HEADER_SIZE {
            debug!("{} sent an impossible fragment length", peer);
            break;
        }
        pdu.extend(link.read(size - rpc::RPC_HEADER_SIZE)?);

        match connection.process_pdu(&pdu, dispatcher) {
            Ok(Some(reply)) => link.write_raw(&reply)?,
            Ok(None) => (),
            Err(e) => {
                debug!("closing {}: {:?}", peer, e);
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto;
    use crate::core::kms::{KmsRequest, KmsResponse, KmsVersion};
    use crate::core::rpc::{client_bind, client_request, ndr_wrap};
    use crate::core::MemoryStore;
    use std::io::{Cursor, Read, Write};
    use uuid::Uuid;

    fn dispatcher() -> Dispatcher<MemoryStore> {
        Dispatcher::new(
            ServerIdentity::new(&ServerConfig::default()),
            MemoryStore::new(),
        )
    }

    fn v4_request_blob() -> Vec<u8> {
        let request = KmsRequest {
            version: KmsVersion::V4,
            is_client_vm: 0,
            license_status: 2,
            grace_time: 43200,
            application_id: crate::core::epid::APP_WINDOWS,
            sku_id: Uuid::from_u128(0xae2ee509_1b34_41c0_acb7_6d4650168915),
            kms_counted_id: Uuid::from_u128(0x212a64dc_43b1_4d3d_a30c_2fc69d2095c6),
            client_machine_id: Uuid::from_u128(0x794f_1f09),
            required_client_count: 25,
            request_time: 132_000_000_000_000_000,
            previous_client_machine_id: Uuid::nil(),
            machine_name: String::from("TESTPC"),
            hw_info: None,
        };
        let mut blob = request.to_bytes().unwrap();
        crypto::pad(&mut blob);
        let hash = crypto::chained_hash(&crypto::V4_KEY, &blob);
        blob.extend_from_slice(&hash);
        blob
    }

    fn bound_connection(dispatcher: &Dispatcher<MemoryStore>) -> Connection {
        let mut connection = Connection::new();
        let reply = connection
            .process_pdu(&client_bind(1, &rpc::KMS_INTERFACE), dispatcher)
            .unwrap()
            .unwrap();
        assert_eq!(rpc::decode_header(&reply).unwrap().ptype, PduType::BindAck);
        connection
    }

    #[test]
    fn test_connection_starts_binding() {
        assert_eq!(Connection::new().state(), ConnectionState::Binding);
    }

    #[test]
    fn test_request_before_bind_closes() {
        let dispatcher = dispatcher();
        let mut connection = Connection::new();
        let pdu = client_request(1, 0x03, 1, &ndr_wrap(&[0u8; 8]));
        assert!(connection.process_pdu(&pdu, &dispatcher).is_err());
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_bind_then_request_then_more_requests() {
        let dispatcher = dispatcher();
        let mut connection = bound_connection(&dispatcher);
        assert_eq!(connection.state(), ConnectionState::Bound);

        // clients may issue several requests on one association
        for call_id in 2..5 {
            let pdu = client_request(call_id, 0x03, 1, &ndr_wrap(&v4_request_blob()));
            let reply = connection.process_pdu(&pdu, &dispatcher).unwrap().unwrap();
            let header = rpc::decode_header(&reply).unwrap();
            assert_eq!(header.ptype, PduType::Response);
            assert_eq!(header.call_id, call_id);
            assert_eq!(connection.state(), ConnectionState::Bound);
        }
    }

    #[test]
    fn test_fragmented_request_yields_single_response() {
        let dispatcher = dispatcher();
        let mut connection = bound_connection(&dispatcher);

        let stub = ndr_wrap(&v4_request_blob());
        let (first, second) = stub.split_at(100);
        assert_eq!(
            connection
                .process_pdu(&client_request(0x42, rpc::PFC_FIRST_FRAG, 1, first), &dispatcher)
                .unwrap(),
            None
        );
        let reply = connection
            .process_pdu(&client_request(0x42, rpc::PFC_LAST_FRAG, 1, second), &dispatcher)
            .unwrap()
            .unwrap();
        let header = rpc::decode_header(&reply).unwrap();
        assert_eq!(header.ptype, PduType::Response);
        assert_eq!(header.call_id, 0x42);
        assert_eq!(header.frag_length as usize, reply.len());
    }

    #[test]
    fn test_unknown_opnum_faults_but_keeps_connection() {
        let dispatcher = dispatcher();
        let mut connection = bound_connection(&dispatcher);

        let mut pdu = client_request(5, 0x03, 1, &ndr_wrap(&[0u8; 8]));
        pdu[rpc::RPC_HEADER_SIZE + 6] = 1; // opnum
        let reply = connection.process_pdu(&pdu, &dispatcher).unwrap().unwrap();
        let header = rpc::decode_header(&reply).unwrap();
        assert_eq!(header.ptype, PduType::Fault);
        assert_eq!(
            u32::from_le_bytes([reply[24], reply[25], reply[26], reply[27]]),
            rpc::NCA_OP_RNG_ERROR
        );
        assert_eq!(connection.state(), ConnectionState::Bound);

        // the association still answers well formed requests
        let pdu = client_request(6, 0x03, 1, &ndr_wrap(&v4_request_blob()));
        assert!(connection.process_pdu(&pdu, &dispatcher).unwrap().is_some());
    }

    #[test]
    fn test_auth_trailer_is_a_protocol_fault() {
        let dispatcher = dispatcher();
        let mut connection = Connection::new();
        let mut pdu = client_bind(1, &rpc::KMS_INTERFACE);
        pdu[10] = 8; // auth_length
        let reply = connection.process_pdu(&pdu, &dispatcher).unwrap().unwrap();
        let header = rpc::decode_header(&reply).unwrap();
        assert_eq!(header.ptype, PduType::Fault);
        assert_eq!(
            u32::from_le_bytes([reply[24], reply[25], reply[26], reply[27]]),
            rpc::NCA_PROTO_ERROR
        );
    }

    #[test]
    fn test_tampered_v4_request_closes_silently() {
        let dispatcher = dispatcher();
        let mut connection = bound_connection(&dispatcher);

        let mut blob = v4_request_blob();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        let pdu = client_request(3, 0x03, 1, &ndr_wrap(&blob));
        assert_eq!(connection.process_pdu(&pdu, &dispatcher).unwrap(), None);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_serves_activation_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Arc::new(ServerConfig::default());
        let dispatcher = Arc::new(dispatcher());
        let active = Arc::new(AtomicUsize::new(0));
        thread::spawn(move || accept_loop(listener, config, dispatcher, active));

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let read_pdu = |client: &mut TcpStream| -> Vec<u8> {
            let mut header = vec![0u8; rpc::RPC_HEADER_SIZE];
            client.read_exact(&mut header).unwrap();
            let size = rpc::pdu_size(&header).unwrap();
            let mut rest = vec![0u8; size - rpc::RPC_HEADER_SIZE];
            client.read_exact(&mut rest).unwrap();
            header.extend(rest);
            header
        };

        client
            .write_all(&client_bind(1, &rpc::KMS_INTERFACE))
            .unwrap();
        let ack = read_pdu(&mut client);
        assert_eq!(rpc::decode_header(&ack).unwrap().ptype, PduType::BindAck);

        client
            .write_all(&client_request(2, 0x03, 1, &ndr_wrap(&v4_request_blob())))
            .unwrap();
        let reply = read_pdu(&mut client);
        let header = rpc::decode_header(&reply).unwrap();
        assert_eq!(header.ptype, PduType::Response);
        assert_eq!(header.call_id, 2);

        // unwrap the stub and check the activation took
        let stub = &reply[24..];
        let count = u32::from_le_bytes([stub[0], stub[1], stub[2], stub[3]]) as usize;
        let blob = &stub[4..4 + count];
        let (body, _) = blob.split_at(blob.len() - 16);
        let response = KmsResponse::from_bytes(&mut Cursor::new(body)).unwrap();
        assert_eq!(response.version, KmsVersion::V4);
        assert_eq!(response.client_count, 50);
    }

    #[test]
    fn test_overloaded_server_refuses_new_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Arc::new(ServerConfig {
            high_water: 0,
            ..ServerConfig::default()
        });
        let dispatcher = Arc::new(dispatcher());
        let active = Arc::new(AtomicUsize::new(0));
        thread::spawn(move || accept_loop(listener, config, dispatcher, active));

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buffer = [0u8; 1];
        // the connection is dropped without a byte
        assert_eq!(client.read(&mut buffer).unwrap_or(0), 0);
    }
}
