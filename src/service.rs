use std::{
    error::Error,
    io,
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread::spawn,
};

use tracing::{debug, info, warn};
use tungstenite::{
    accept_hdr,
    handshake::server::{ErrorResponse, Request, Response},
    Message, WebSocket,
};

use crate::streamer;

type Peers = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

/// Serves websockets on `addr`: lines are received on `/ws/points`
/// and results are broadcast to every client connected on `/ws/results`.
///
/// Returns the input lines and result writer to build a `Streamer` from.
pub fn service(
    addr: impl ToSocketAddrs,
) -> io::Result<(
    impl Iterator<Item = Result<String, Box<dyn Error>>>,
    impl FnMut(String) -> Result<(), Box<dyn Error>>,
)> {
    let server = TcpListener::bind(addr)?;
    info!(addr = ?server.local_addr()?, "listening");
    let (point_producer, point_receiver) = mpsc::channel::<String>();
    let (result_producer, result_receiver) = mpsc::channel::<String>();
    spawn(move || start_server(server, point_producer, result_receiver));
    Ok(streamer::channels(point_receiver, result_producer))
}

fn start_server(
    server: TcpListener,
    point_producer: Sender<String>,
    result_receiver: Receiver<String>,
) {
    let peers: Peers = Arc::new(Mutex::new(vec![]));
    start_dispatcher(peers.clone(), result_receiver);
    start_websockets(server, peers, point_producer);
}

fn start_websockets(server: TcpListener, peers: Peers, point_producer: Sender<String>) {
    for stream in server.incoming() {
        let peers = peers.clone();
        let point_producer = point_producer.clone();
        spawn(move || {
            if let Some((path, websocket)) = get_websocket(stream) {
                if path.ends_with("/ws/points") {
                    handle_point_receiver(websocket, point_producer)
                } else if path.ends_with("/ws/results") {
                    handle_result_consumer(websocket, peers)
                } else {
                    warn!(%path, "unknown route");
                }
            }
        });
    }
}

fn get_websocket(stream: io::Result<TcpStream>) -> Option<(String, WebSocket<TcpStream>)> {
    let stream = stream
        .map_err(|reason| warn!(%reason, "connection failed"))
        .ok()?;
    let mut path: String = String::new();
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = String::from(req.uri().path());
        Ok(response)
    };
    let websocket = accept_hdr(stream, callback)
        .map_err(|reason| warn!(%reason, "handshake failed"))
        .ok()?;
    Some((path, websocket))
}

fn handle_result_consumer(websocket: WebSocket<TcpStream>, peers: Peers) {
    match peers.lock() {
        Ok(mut peers) => peers.push(websocket),
        Err(reason) => warn!(%reason, "results peer rejected"),
    }
}

fn handle_point_receiver(mut websocket: WebSocket<TcpStream>, point_producer: Sender<String>) {
    loop {
        match websocket.read_message() {
            Ok(message) => {
                if !read_point(message, &point_producer) {
                    break;
                }
            }
            Err(reason) => {
                debug!(%reason, "points peer gone");
                break;
            }
        };
    }
}

fn read_point(message: Message, point_producer: &Sender<String>) -> bool {
    match message {
        Message::Text(txt) => match point_producer.send(txt) {
            Ok(()) => true,
            Err(reason) => {
                warn!(%reason, "stream closed");
                false
            }
        },
        Message::Binary(_) => {
            warn!("unsupported binary message");
            true
        }
        Message::Close(_) => false,
        _ => true,
    }
}

fn start_dispatcher(peers: Peers, result_receiver: Receiver<String>) {
    spawn(move || {
        for msg in result_receiver {
            if let Ok(mut peers) = peers.lock() {
                peers.retain_mut(|peer| send_result(peer, msg.clone()));
            }
        }
    });
}

/// Returns false when the peer must be dropped.
fn send_result(peer: &mut WebSocket<TcpStream>, msg: String) -> bool {
    if !peer.can_write() {
        return false;
    }
    match peer.write_message(Message::Text(msg)) {
        Ok(()) => true,
        Err(reason) => {
            debug!(%reason, "results peer gone");
            false
        }
    }
}
