//! smoltcp plumbing shared by the station link and the setup access point.

use esp_radio::wifi::WifiDevice;
use heapless::Vec;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet, SocketStorage};
use smoltcp::socket::dhcpv4::{Event as DhcpEvent, Socket as DhcpSocket};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpAddress, IpCidr, Ipv4Address};

pub const MAX_DNS_SERVERS: usize = 3;

/// Milliseconds on the embassy time driver esp-rtos runs, the same clock the
/// setup network's DHCP leases are stamped with.
pub fn now_ms() -> u64 {
    embassy_time::Instant::now().as_millis()
}

fn timestamp() -> SmoltcpInstant {
    SmoltcpInstant::from_millis(now_ms() as i64)
}

/// What a DHCP event changed.
pub enum Lease {
    Bound {
        address: Ipv4Address,
        dns: Vec<Ipv4Address, MAX_DNS_SERVERS>,
    },
    Lost,
}

/// One radio interface with its IP stack and sockets.
pub struct Stack {
    pub iface: Interface,
    pub device: WifiDevice<'static>,
    pub sockets: SocketSet<'static>,
}

impl Stack {
    pub fn new(
        mut device: WifiDevice<'static>,
        mac: [u8; 6],
        storage: &'static mut [SocketStorage<'static>],
    ) -> Self {
        let hw_addr = HardwareAddress::Ethernet(EthernetAddress(mac));
        let iface = Interface::new(Config::new(hw_addr), &mut device, timestamp());
        Self {
            iface,
            device,
            sockets: SocketSet::new(storage),
        }
    }

    pub fn poll(&mut self) {
        self.iface.poll(timestamp(), &mut self.device, &mut self.sockets);
    }

    pub fn add_tcp(&mut self, rx: &'static mut [u8], tx: &'static mut [u8]) -> SocketHandle {
        let socket = TcpSocket::new(SocketBuffer::new(rx), SocketBuffer::new(tx));
        self.sockets.add(socket)
    }

    pub fn tcp(&mut self, handle: SocketHandle) -> &mut TcpSocket<'static> {
        self.sockets.get_mut::<TcpSocket>(handle)
    }

    /// Fixed address for the access point side.
    pub fn set_static_address(&mut self, octets: [u8; 4], prefix_len: u8) {
        let [a, b, c, d] = octets;
        self.iface.update_ip_addrs(|addrs| {
            addrs.clear();
            addrs.push(IpCidr::new(IpAddress::v4(a, b, c, d), prefix_len)).ok();
        });
    }

    /// Apply a DHCP event to the interface and report what changed.
    pub fn poll_dhcp(&mut self, handle: SocketHandle) -> Option<Lease> {
        let dhcp_socket = self.sockets.get_mut::<DhcpSocket>(handle);
        match dhcp_socket.poll()? {
            DhcpEvent::Configured(dhcp_config) => {
                let addr = dhcp_config.address;
                self.iface.update_ip_addrs(|addrs| {
                    addrs.clear();
                    addrs.push(IpCidr::Ipv4(addr)).ok();
                });
                if let Some(router) = dhcp_config.router {
                    self.iface.routes_mut().add_default_ipv4_route(router).ok();
                }
                let mut dns = Vec::new();
                for server in dhcp_config.dns_servers.iter() {
                    let _ = dns.push(*server);
                }
                Some(Lease::Bound {
                    address: addr.address(),
                    dns,
                })
            }
            DhcpEvent::Deconfigured => {
                self.iface.update_ip_addrs(|addrs| addrs.clear());
                self.iface.routes_mut().remove_default_ipv4_route();
                Some(Lease::Lost)
            }
        }
    }

    /// Drop the address and routes after the link went away and start DHCP over.
    pub fn forget_address(&mut self, dhcp: SocketHandle) {
        self.iface.update_ip_addrs(|addrs| addrs.clear());
        self.iface.routes_mut().remove_default_ipv4_route();
        self.sockets.get_mut::<DhcpSocket>(dhcp).reset();
    }

    pub fn has_address(&self) -> bool {
        !self.iface.ip_addrs().is_empty()
    }

    /// Keep polling until the socket's send queue drains or `timeout_ms` runs out.
    pub fn flush(&mut self, handle: SocketHandle, timeout_ms: u64) {
        let deadline = now_ms() + timeout_ms;
        loop {
            self.poll();
            let socket = self.tcp(handle);
            if socket.send_queue() == 0 || !socket.is_open() {
                return;
            }
            if now_ms() > deadline {
                log::debug!("net: flush timed out with {} bytes queued", socket.send_queue());
                return;
            }
            esp_radio_rtos_driver::usleep(1_000);
        }
    }
}
