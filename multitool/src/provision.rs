//! Setup access point: a DHCP server and the credential form on 192.168.4.1.
//!
//! Runs on its own interface so the station side keeps its sockets. The
//! radio only switches into access-point mode while the window is open.

use core::net::Ipv4Addr;

use edge_dhcp::server::{Server as DhcpServer, ServerOptions as DhcpServerOptions};
use edge_dhcp::{Options as DhcpOptions, Packet as DhcpPacket};
use esp_radio::wifi::WifiDevice;
use multitool_core::error::HttpError;
use multitool_core::http::Request;
use multitool_core::portal::{self, SETUP_ADDRESS};
use multitool_core::settings::WifiCredentials;
use smoltcp::iface::{SocketHandle, SocketStorage};
use smoltcp::socket::udp::{PacketBuffer, PacketMetadata, Socket as UdpSocket};
use smoltcp::wire::{IpAddress, IpEndpoint};
use static_cell::ConstStaticCell;

use crate::net::Stack;
use crate::server::{rejection, Listener, HTTP_PORT, REQUEST_CAPACITY};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const DHCP_PACKET: usize = 600;
const FORM_BUF: usize = 1536;
const FLUSH_TIMEOUT_MS: u64 = 500;

static SOCKETS: ConstStaticCell<[SocketStorage<'static>; 3]> =
    ConstStaticCell::new([SocketStorage::EMPTY; 3]);
static DHCP_RX_META: ConstStaticCell<[PacketMetadata; 2]> =
    ConstStaticCell::new([PacketMetadata::EMPTY; 2]);
static DHCP_TX_META: ConstStaticCell<[PacketMetadata; 2]> =
    ConstStaticCell::new([PacketMetadata::EMPTY; 2]);
static DHCP_RX: ConstStaticCell<[u8; DHCP_PACKET]> = ConstStaticCell::new([0; DHCP_PACKET]);
static DHCP_TX: ConstStaticCell<[u8; DHCP_PACKET]> = ConstStaticCell::new([0; DHCP_PACKET]);
static FORM_RX: ConstStaticCell<[u8; FORM_BUF]> = ConstStaticCell::new([0; FORM_BUF]);
static FORM_TX: ConstStaticCell<[u8; FORM_BUF]> = ConstStaticCell::new([0; FORM_BUF]);
static FORM_REQUEST: ConstStaticCell<[u8; REQUEST_CAPACITY]> =
    ConstStaticCell::new([0; REQUEST_CAPACITY]);

fn server_ip() -> Ipv4Addr {
    let [a, b, c, d] = SETUP_ADDRESS;
    Ipv4Addr::new(a, b, c, d)
}

pub struct Portal {
    stack: Stack,
    dhcp: SocketHandle,
    leases: DhcpServer<fn() -> u64, 8>,
    form: Listener,
}

impl Portal {
    /// Build the access point stack. Call once; the buffers are static.
    pub fn new(device: WifiDevice<'static>) -> Self {
        let mut stack = Stack::new(device, esp_radio::wifi::ap_mac(), SOCKETS.take());
        stack.set_static_address(SETUP_ADDRESS, 24);

        let rx = PacketBuffer::new(&mut DHCP_RX_META.take()[..], &mut DHCP_RX.take()[..]);
        let tx = PacketBuffer::new(&mut DHCP_TX_META.take()[..], &mut DHCP_TX.take()[..]);
        let mut socket = UdpSocket::new(rx, tx);
        if let Err(e) = socket.bind(DHCP_SERVER_PORT) {
            log::error!("portal: DHCP bind failed: {:?}", e);
        }
        let dhcp = stack.sockets.add(socket);

        let mut leases = DhcpServer::<_, 8>::new_with_et(server_ip());
        leases.range_start = Ipv4Addr::new(192, 168, 4, 50);
        leases.range_end = Ipv4Addr::new(192, 168, 4, 200);

        let form = Listener::new(
            &mut stack,
            HTTP_PORT,
            FORM_RX.take(),
            FORM_TX.take(),
            FORM_REQUEST.take(),
        );

        Self {
            stack,
            dhcp,
            leases,
            form,
        }
    }

    /// One pass: hand out addresses and answer the form. Returns credentials
    /// once they were submitted and the confirmation page has gone out.
    pub fn poll(&mut self) -> Option<WifiCredentials> {
        self.stack.poll();
        self.serve_dhcp();
        let creds = self.serve_form();
        self.stack.poll();
        creds
    }

    /// Drop whatever connection is still open.
    pub fn close(&mut self) {
        self.stack.tcp(self.form.handle()).abort();
        self.stack.poll();
    }

    fn serve_dhcp(&mut self) {
        let socket = self.stack.sockets.get_mut::<UdpSocket>(self.dhcp);
        let mut buf = [0u8; DHCP_PACKET];
        let Ok((len, _)) = socket.recv_slice(&mut buf) else {
            return;
        };

        let request = match DhcpPacket::decode(&buf[..len]) {
            Ok(pkt) => pkt,
            Err(e) => {
                log::debug!("portal: DHCP decode error: {:?}", e);
                return;
            }
        };

        let mut gw_buf = [Ipv4Addr::UNSPECIFIED; 1];
        let options = DhcpServerOptions::new(server_ip(), Some(&mut gw_buf));
        let mut opt_buf = DhcpOptions::buf();
        let Some(reply) = self.leases.handle_request(&mut opt_buf, &options, &request) else {
            return;
        };

        let mut out = [0u8; DHCP_PACKET];
        match reply.encode(&mut out) {
            Ok(encoded) => {
                // Clients have no address yet, so replies are broadcast
                let dest = IpEndpoint::new(IpAddress::v4(255, 255, 255, 255), DHCP_CLIENT_PORT);
                if let Err(e) = socket.send_slice(encoded, dest) {
                    log::debug!("portal: DHCP send error: {:?}", e);
                }
            }
            Err(e) => log::debug!("portal: DHCP encode error: {:?}", e),
        }
    }

    fn serve_form(&mut self) -> Option<WifiCredentials> {
        if !self.form.receive(&mut self.stack) {
            return None;
        }
        let (response, creds) = match Request::parse(self.form.buffered()) {
            Err(HttpError::Incomplete) if !self.form.is_full() => return None,
            Err(HttpError::Incomplete) => (rejection(HttpError::TooLarge), None),
            Err(e) => (rejection(e), None),
            Ok(req) if !req.is_complete() && !self.form.is_full() => return None,
            Ok(req) => portal::handle(&req),
        };
        self.form.respond(&mut self.stack, &response);
        if creds.is_some() {
            self.stack.flush(self.form.handle(), FLUSH_TIMEOUT_MS);
        }
        creds
    }
}
