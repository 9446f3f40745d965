//! HTTP over raw smoltcp sockets: the operator API and the firmware upload.
//!
//! Requests are buffered whole (head plus a small body) and handed to the
//! core's router. `POST /update` is the exception: once its head is in, the
//! body is streamed straight into the staging partition while the socket is
//! polled, so an image never has to fit in RAM.

use multitool_core::api::{Deferred, SystemInfo};
use multitool_core::error::{HttpError, OtaError};
use multitool_core::http::{Method, Request, Response, MAX_BODY, MAX_HEAD};
use multitool_core::network::NetworkService;
use multitool_core::ota::{OtaSession, StagingArea};
use multitool_core::Clock;
use smoltcp::iface::{SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, State as TcpState};
use static_cell::ConstStaticCell;

use crate::display::OledBus;
use crate::net::Stack;
use crate::storage::{FlashSlots, OtaStaging};
use crate::EspClock;

pub const HTTP_PORT: u16 = 80;
pub const REQUEST_CAPACITY: usize = MAX_HEAD + MAX_BODY;

/// Two connections so a browser's parallel fetches are not refused.
const API_SOCKETS: usize = 2;
const SOCKET_BUF: usize = 1536;
const OTA_CHUNK: usize = 1024;
const OTA_IDLE_TIMEOUT_MS: u64 = 10_000;
const FLUSH_TIMEOUT_MS: u64 = 1_000;

static API_RX: ConstStaticCell<[[u8; SOCKET_BUF]; API_SOCKETS]> =
    ConstStaticCell::new([[0; SOCKET_BUF]; API_SOCKETS]);
static API_TX: ConstStaticCell<[[u8; SOCKET_BUF]; API_SOCKETS]> =
    ConstStaticCell::new([[0; SOCKET_BUF]; API_SOCKETS]);
static API_REQUESTS: ConstStaticCell<[[u8; REQUEST_CAPACITY]; API_SOCKETS]> =
    ConstStaticCell::new([[0; REQUEST_CAPACITY]; API_SOCKETS]);

pub type Network = NetworkService<'static, EspClock, OledBus, FlashSlots>;

/// A listening socket plus the request it is accumulating.
pub struct Listener {
    handle: SocketHandle,
    port: u16,
    buf: &'static mut [u8],
    len: usize,
    answered: bool,
}

impl Listener {
    pub fn new(
        stack: &mut Stack,
        port: u16,
        rx: &'static mut [u8],
        tx: &'static mut [u8],
        buf: &'static mut [u8],
    ) -> Self {
        let handle = stack.add_tcp(rx, tx);
        stack.tcp(handle).listen(port).ok();
        Self {
            handle,
            port,
            buf,
            len: 0,
            answered: false,
        }
    }

    pub fn handle(&self) -> SocketHandle {
        self.handle
    }

    pub fn is_established(&self, sockets: &SocketSet<'_>) -> bool {
        sockets.get::<TcpSocket>(self.handle).state() == TcpState::Established
    }

    /// Recycle finished sockets and pull in new bytes. Returns true when the
    /// buffer grew and is worth parsing again.
    pub fn receive(&mut self, stack: &mut Stack) -> bool {
        let socket = stack.tcp(self.handle);

        // Socket state machine for immediate reuse
        match socket.state() {
            TcpState::Closed => {
                self.len = 0;
                self.answered = false;
                socket.listen(self.port).ok();
                return false;
            }
            TcpState::CloseWait => {
                socket.close();
                return false;
            }
            TcpState::TimeWait | TcpState::LastAck | TcpState::Closing => {
                // Skip TIME_WAIT so the port is listening again right away
                socket.abort();
                return false;
            }
            TcpState::Listen | TcpState::SynReceived | TcpState::SynSent => return false,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {}
        }

        if self.answered || !socket.can_recv() || self.len == self.buf.len() {
            return false;
        }
        match socket.recv_slice(&mut self.buf[self.len..]) {
            Ok(n) if n > 0 => {
                self.len += n;
                true
            }
            _ => false,
        }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Send `response` and close our side.
    pub fn respond(&mut self, stack: &mut Stack, response: &Response) {
        let socket = stack.tcp(self.handle);
        if socket.send_slice(response.serialize().as_bytes()).is_err() {
            log::debug!("http: response dropped, connection gone");
        }
        socket.close();
        self.answered = true;
        self.len = 0;
    }
}

/// Answer for a request that never parsed.
pub fn rejection(e: HttpError) -> Response {
    match e {
        HttpError::TooLarge => Response::text(413, "Payload Too Large"),
        _ => Response::text(400, "Bad Request"),
    }
}

/// What to do with the bytes buffered on one listener.
enum Next {
    Wait,
    Answer(Response, Option<Deferred>),
    Update(usize),
}

/// The operator API on port 80.
pub struct ApiServer {
    listeners: [Listener; API_SOCKETS],
}

impl ApiServer {
    pub fn new(stack: &mut Stack) -> Self {
        let [rx0, rx1] = API_RX.take();
        let [tx0, tx1] = API_TX.take();
        let [req0, req1] = API_REQUESTS.take();
        Self {
            listeners: [
                Listener::new(stack, HTTP_PORT, rx0, tx0, req0),
                Listener::new(stack, HTTP_PORT, rx1, tx1, req1),
            ],
        }
    }

    /// Established sessions right now.
    pub fn clients(&self, stack: &Stack) -> u16 {
        self.listeners
            .iter()
            .filter(|l| l.is_established(&stack.sockets))
            .count() as u16
    }

    /// Answer every request that is ready. Deferred work is returned only
    /// after its response has been flushed to the client.
    pub fn service<I: SystemInfo>(
        &mut self,
        stack: &mut Stack,
        net: &mut Network,
        staging: &mut OtaStaging,
        info: impl Fn() -> I,
    ) -> Option<Deferred> {
        let mut deferred = None;
        for listener in self.listeners.iter_mut() {
            if !listener.receive(stack) {
                continue;
            }
            let next = match Request::parse(listener.buffered()) {
                Err(HttpError::Incomplete) if !listener.is_full() => Next::Wait,
                Err(HttpError::Incomplete) => Next::Answer(rejection(HttpError::TooLarge), None),
                Err(e) => {
                    log::debug!("http: {}", e);
                    Next::Answer(rejection(e), None)
                }
                Ok(req) if req.method == Method::Post && req.path == "/update" => {
                    match net.authorize_update(&req, staging.capacity()) {
                        Ok(declared) => Next::Update(declared),
                        Err(e) => Next::Answer(e.into(), None),
                    }
                }
                Ok(req) if !req.is_complete() && listener.is_full() => {
                    Next::Answer(rejection(HttpError::TooLarge), None)
                }
                Ok(req) if !req.is_complete() => Next::Wait,
                Ok(req) => {
                    log::debug!("http: {:?} {}", req.method, req.path);
                    let reply = net.handle_http(&req, &info());
                    Next::Answer(reply.response, reply.deferred)
                }
            };

            match next {
                Next::Wait => {}
                Next::Answer(response, then) => {
                    listener.respond(stack, &response);
                    if then.is_some() {
                        stack.flush(listener.handle(), FLUSH_TIMEOUT_MS);
                        deferred = then;
                    }
                }
                Next::Update(declared) => {
                    crate::heap_debug::log_heap_stats("ota:start");
                    let received = receive_image(stack, listener, net, staging, declared);
                    let (response, then) = match received {
                        Ok(len) => {
                            log::info!("ota: {} bytes staged, restarting", len);
                            let done = Response::text(200, "Update Success! Rebooting...");
                            (done, Some(Deferred::Restart))
                        }
                        Err(e) => {
                            log::error!("ota: {}", e);
                            (Response::text(500, "Update Failed"), None)
                        }
                    };
                    listener.respond(stack, &response);
                    stack.flush(listener.handle(), FLUSH_TIMEOUT_MS);
                    deferred = then;
                }
            }
            if deferred.is_some() {
                break;
            }
        }
        deferred
    }
}

/// Stream the update body into the staging partition, then verify and activate it.
fn receive_image(
    stack: &mut Stack,
    listener: &mut Listener,
    net: &Network,
    staging: &mut OtaStaging,
    declared: usize,
) -> Result<usize, OtaError> {
    let clock = net.clock();
    let gate = net.flash();
    let mut session = OtaSession::begin(staging, gate, clock, declared)?;

    // Body bytes that arrived together with the head.
    {
        let req = Request::parse(listener.buffered()).map_err(|_| OtaError::Truncated)?;
        let first = &req.body[..req.body.len().min(declared)];
        session.write(staging, gate, clock, first)?;
    }

    let mut chunk = [0u8; OTA_CHUNK];
    let mut last_progress = clock.now_ms();
    let report_every = (declared / 4).max(1);
    let mut next_report = report_every;
    while !session.is_complete() {
        stack.poll();
        let socket = stack.tcp(listener.handle());
        let want = (session.expected() - session.written()).min(OTA_CHUNK);
        let n = if socket.can_recv() {
            socket.recv_slice(&mut chunk[..want]).unwrap_or(0)
        } else {
            0
        };

        let now = clock.now_ms();
        if n > 0 {
            session.write(staging, gate, clock, &chunk[..n])?;
            last_progress = now;
            if session.written() >= next_report {
                log::info!("ota: {}/{} bytes", session.written(), declared);
                next_report += report_every;
            }
            continue;
        }
        if !socket.may_recv() || now.saturating_sub(last_progress) > OTA_IDLE_TIMEOUT_MS {
            return Err(OtaError::Truncated);
        }
        esp_radio_rtos_driver::usleep(1_000);
    }

    session.finish(staging, gate, clock)
}
