//! Broker connection for the MQTT session: one TCP socket plus DNS.
//!
//! `open` never blocks. A hostname starts an A query, and the connect is
//! issued from `is_open` once the answer arrives. The session layer polls
//! `is_open` and `is_closed` and applies its own timeouts.

use multitool_core::error::MqttError;
use multitool_core::mqtt::Transport;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::dns::{DnsQuery, GetQueryResultError, QueryHandle, Socket as DnsSocket};
use smoltcp::socket::tcp::State as TcpState;
use smoltcp::wire::{DnsQueryType, IpAddress, IpEndpoint, Ipv4Address};
use static_cell::ConstStaticCell;

use crate::net::Stack;

const SOCKET_BUF: usize = 1024;
const FIRST_LOCAL_PORT: u16 = 49152;

static BROKER_RX: ConstStaticCell<[u8; SOCKET_BUF]> = ConstStaticCell::new([0; SOCKET_BUF]);
static BROKER_TX: ConstStaticCell<[u8; SOCKET_BUF]> = ConstStaticCell::new([0; SOCKET_BUF]);
static DNS_QUERIES: ConstStaticCell<[Option<DnsQuery>; 1]> = ConstStaticCell::new([None]);

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    Resolving { query: QueryHandle, port: u16 },
    Connecting,
    Failed,
}

pub struct BrokerSocket {
    tcp: SocketHandle,
    dns: SocketHandle,
    phase: Phase,
    next_port: u16,
}

impl BrokerSocket {
    pub fn new(stack: &mut Stack) -> Self {
        let tcp = stack.add_tcp(BROKER_RX.take(), BROKER_TX.take());
        let dns = stack.sockets.add(DnsSocket::new(&[], &mut DNS_QUERIES.take()[..]));
        Self {
            tcp,
            dns,
            phase: Phase::Idle,
            next_port: FIRST_LOCAL_PORT,
        }
    }

    /// Resolvers handed out with the DHCP lease.
    pub fn set_dns_servers(&self, stack: &mut Stack, servers: &[Ipv4Address]) {
        let mut addrs = heapless::Vec::<IpAddress, { crate::net::MAX_DNS_SERVERS }>::new();
        for server in servers {
            let _ = addrs.push(IpAddress::Ipv4(*server));
        }
        stack.sockets.get_mut::<DnsSocket>(self.dns).update_servers(&addrs);
    }

    /// Borrow the socket together with the stack it lives on.
    pub fn link<'s>(&'s mut self, stack: &'s mut Stack) -> BrokerLink<'s> {
        BrokerLink { socket: self, stack }
    }

    fn local_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port == u16::MAX {
            FIRST_LOCAL_PORT
        } else {
            port + 1
        };
        port
    }
}

pub struct BrokerLink<'s> {
    socket: &'s mut BrokerSocket,
    stack: &'s mut Stack,
}

impl BrokerLink<'_> {
    fn connect(&mut self, addr: IpAddress, port: u16) -> Result<(), MqttError> {
        let local = self.socket.local_port();
        let cx = self.stack.iface.context();
        let tcp = self.stack.sockets.get_mut::<smoltcp::socket::tcp::Socket>(self.socket.tcp);
        tcp.connect(cx, IpEndpoint::new(addr, port), local).map_err(|e| {
            log::warn!("mqtt: connect to {}:{} failed: {:?}", addr, port, e);
            MqttError::Transport
        })?;
        log::debug!("mqtt: connecting to {}:{}", addr, port);
        self.socket.phase = Phase::Connecting;
        Ok(())
    }

    fn cancel_query(&mut self) {
        if let Phase::Resolving { query, .. } = self.socket.phase {
            self.stack.sockets.get_mut::<DnsSocket>(self.socket.dns).cancel_query(query);
        }
    }

    /// Issue the connect once the broker's name has resolved.
    fn advance(&mut self) {
        let Phase::Resolving { query, port } = self.socket.phase else {
            return;
        };
        let dns = self.stack.sockets.get_mut::<DnsSocket>(self.socket.dns);
        match dns.get_query_result(query) {
            Err(GetQueryResultError::Pending) => {}
            Err(GetQueryResultError::Failed) => {
                log::warn!("mqtt: broker name did not resolve");
                self.socket.phase = Phase::Failed;
            }
            Ok(addrs) => match addrs.first().copied() {
                Some(addr) => {
                    if self.connect(addr, port).is_err() {
                        self.socket.phase = Phase::Failed;
                    }
                }
                None => self.socket.phase = Phase::Failed,
            },
        }
    }
}

impl Transport for BrokerLink<'_> {
    fn open(&mut self, host: &str, port: u16) -> Result<(), MqttError> {
        self.cancel_query();
        self.stack.tcp(self.socket.tcp).abort();
        self.socket.phase = Phase::Idle;

        if let Ok(addr) = host.parse::<Ipv4Address>() {
            return self.connect(IpAddress::Ipv4(addr), port);
        }

        let cx = self.stack.iface.context();
        let dns = self.stack.sockets.get_mut::<DnsSocket>(self.socket.dns);
        match dns.start_query(cx, host, DnsQueryType::A) {
            Ok(query) => {
                self.socket.phase = Phase::Resolving { query, port };
                Ok(())
            }
            Err(e) => {
                log::warn!("mqtt: cannot resolve {}: {:?}", host, e);
                Err(MqttError::Transport)
            }
        }
    }

    fn is_open(&mut self) -> bool {
        self.advance();
        matches!(self.socket.phase, Phase::Connecting) && self.stack.tcp(self.socket.tcp).may_send()
    }

    fn is_closed(&mut self) -> bool {
        self.advance();
        match self.socket.phase {
            Phase::Failed => true,
            Phase::Idle | Phase::Resolving { .. } => false,
            Phase::Connecting => matches!(
                self.stack.tcp(self.socket.tcp).state(),
                TcpState::Closed
                    | TcpState::CloseWait
                    | TcpState::Closing
                    | TcpState::LastAck
                    | TcpState::TimeWait
            ),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<(), MqttError> {
        let tcp = self.stack.tcp(self.socket.tcp);
        if !tcp.may_send() || tcp.send_capacity() - tcp.send_queue() < data.len() {
            return Err(MqttError::Transport);
        }
        match tcp.send_slice(data) {
            Ok(n) if n == data.len() => Ok(()),
            _ => Err(MqttError::Transport),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        let tcp = self.stack.tcp(self.socket.tcp);
        if !tcp.can_recv() {
            return 0;
        }
        tcp.recv_slice(buf).unwrap_or(0)
    }

    fn close(&mut self) {
        self.cancel_query();
        self.stack.tcp(self.socket.tcp).close();
        self.socket.phase = Phase::Idle;
    }
}
