//! Remote forwarding bookkeeping and the incoming-channel policy router,
//! plus the strict-vendor gate on OpenSSH extensions.

mod common;

use async_trait::async_trait;
use common::{init_logs, wire};
use sshmux::client::{connect_stream, Config, Handler, Msg};
use sshmux::transport::{
    ChannelOpenKind, ChannelOpenRequest, CompatFlags, Packet, TransportEvent,
};
use sshmux::{Channel, ChannelOpenFailure, Error};
use tokio::sync::mpsc;

fn bootstrap(packet: &Packet) -> Option<Vec<TransportEvent>> {
    match packet {
        Packet::ServiceRequest { .. } => Some(vec![TransportEvent::ServiceAccept {
            name: "ssh-userauth".to_string(),
        }]),
        Packet::AuthNone { .. } => Some(vec![TransportEvent::AuthSuccess]),
        _ => None,
    }
}

#[derive(Debug)]
struct Client {
    tcp: mpsc::UnboundedSender<(String, u32, String, u32)>,
    unix: mpsc::UnboundedSender<String>,
    x11: mpsc::UnboundedSender<String>,
}

impl Client {
    fn new() -> (
        Self,
        mpsc::UnboundedReceiver<(String, u32, String, u32)>,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (tcp, tcp_rx) = mpsc::unbounded_channel();
        let (unix, unix_rx) = mpsc::unbounded_channel();
        let (x11, x11_rx) = mpsc::unbounded_channel();
        (Client { tcp, unix, x11 }, tcp_rx, unix_rx, x11_rx)
    }
}

#[async_trait]
impl Handler for Client {
    type Error = Error;

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<(), Self::Error> {
        let _ = self.tcp.send((
            connected_address.to_string(),
            connected_port,
            originator_address.to_string(),
            originator_port,
        ));
        Ok(())
    }

    async fn server_channel_open_forwarded_streamlocal(
        &mut self,
        _channel: Channel<Msg>,
        socket_path: &str,
    ) -> Result<(), Self::Error> {
        let _ = self.unix.send(socket_path.to_string());
        Ok(())
    }

    async fn server_channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        originator_address: &str,
        _originator_port: u32,
    ) -> Result<(), Self::Error> {
        let _ = self.x11.send(originator_address.to_string());
        Ok(())
    }
}

fn forward_responder(packet: &Packet) -> Vec<TransportEvent> {
    if let Some(events) = bootstrap(packet) {
        return events;
    }
    match packet {
        Packet::TcpIpForward { port: 0, .. } => vec![TransportEvent::RequestSuccess {
            data: 0x1F90u32.to_be_bytes().to_vec(),
        }],
        Packet::TcpIpForward { .. }
        | Packet::CancelTcpIpForward { .. }
        | Packet::StreamLocalForward { .. }
        | Packet::CancelStreamLocalForward { .. }
        | Packet::NoMoreSessions { .. } => vec![TransportEvent::RequestSuccess { data: vec![] }],
        _ => vec![],
    }
}

fn forwarded_tcpip(port: u32) -> TransportEvent {
    TransportEvent::ChannelOpen(ChannelOpenRequest {
        kind: ChannelOpenKind::ForwardedTcpIp {
            connected_address: "0.0.0.0".to_string(),
            connected_port: port,
            originator_address: "203.0.113.5".to_string(),
            originator_port: 50555,
        },
        sender_channel: 70,
        initial_window_size: 64 * 1024,
        maximum_packet_size: 16 * 1024,
    })
}

#[tokio::test]
async fn dynamic_bind_returns_the_assigned_port_and_routes_connections() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(forward_responder);
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let (client, mut tcp_rx, _unix_rx, _x11_rx) = Client::new();
    let handle = connect_stream(Config::new("testhost", "u"), stream, transport, client)
        .await
        .unwrap();

    let port = handle.tcpip_forward("0.0.0.0", 0).await.unwrap();
    assert_eq!(port, 8080);

    script.inject([forwarded_tcpip(8080)]);
    let (address, port, originator, originator_port) = tcp_rx.recv().await.unwrap();
    assert_eq!(
        (address.as_str(), port, originator.as_str(), originator_port),
        ("0.0.0.0", 8080, "203.0.113.5", 50555)
    );
    script
        .wait_for_packet(|p| matches!(p, Packet::ChannelOpenConfirmation { recipient: 70, .. }))
        .await;
}

#[tokio::test]
async fn untrusted_dynamic_replies_keep_the_requested_port() {
    init_logs();
    let (transport, script, stream) = wire();
    script.set_compat(CompatFlags::DYN_RPORT_BUG);
    script.respond_with(forward_responder);
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let (client, _tcp_rx, _unix_rx, _x11_rx) = Client::new();
    let handle = connect_stream(Config::new("testhost", "u"), stream, transport, client)
        .await
        .unwrap();

    // The reply advertises 8080, but this peer's replies are not trusted.
    let port = handle.tcpip_forward("0.0.0.0", 0).await.unwrap();
    assert_eq!(port, 0);
}

#[tokio::test]
async fn unbound_forwarded_connections_are_refused() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(forward_responder);
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let (client, mut tcp_rx, _unix_rx, _x11_rx) = Client::new();
    let handle = connect_stream(Config::new("testhost", "u"), stream, transport, client)
        .await
        .unwrap();
    handle.tcpip_forward("0.0.0.0", 2222).await.unwrap();

    script.inject([forwarded_tcpip(9999)]);
    let failure = script
        .wait_for_packet(|p| matches!(p, Packet::ChannelOpenFailure { .. }))
        .await;
    assert!(matches!(
        failure,
        Packet::ChannelOpenFailure {
            recipient: 70,
            reason: ChannelOpenFailure::AdministrativelyProhibited,
            ..
        }
    ));
    assert!(tcp_rx.try_recv().is_err());
}

#[tokio::test]
async fn cancelled_forwardings_stop_routing() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(forward_responder);
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let (client, mut tcp_rx, _unix_rx, _x11_rx) = Client::new();
    let handle = connect_stream(Config::new("testhost", "u"), stream, transport, client)
        .await
        .unwrap();

    handle.tcpip_forward("0.0.0.0", 2222).await.unwrap();
    handle.cancel_tcpip_forward("0.0.0.0", 2222).await.unwrap();

    script.inject([forwarded_tcpip(2222)]);
    script
        .wait_for_packet(|p| {
            matches!(
                p,
                Packet::ChannelOpenFailure {
                    reason: ChannelOpenFailure::AdministrativelyProhibited,
                    ..
                }
            )
        })
        .await;
    assert!(tcp_rx.try_recv().is_err());
}

#[tokio::test]
async fn streamlocal_forwardings_route_by_path() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(forward_responder);
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let (client, _tcp_rx, mut unix_rx, _x11_rx) = Client::new();
    let handle = connect_stream(Config::new("testhost", "u"), stream, transport, client)
        .await
        .unwrap();
    handle
        .streamlocal_forward("/var/run/app.sock")
        .await
        .unwrap();

    script.inject([TransportEvent::ChannelOpen(ChannelOpenRequest {
        kind: ChannelOpenKind::ForwardedStreamLocal {
            socket_path: "/var/run/app.sock".to_string(),
        },
        sender_channel: 71,
        initial_window_size: 64 * 1024,
        maximum_packet_size: 16 * 1024,
    })]);
    assert_eq!(unix_rx.recv().await.unwrap(), "/var/run/app.sock");

    // A path that was never bound is refused.
    script.inject([TransportEvent::ChannelOpen(ChannelOpenRequest {
        kind: ChannelOpenKind::ForwardedStreamLocal {
            socket_path: "/var/run/other.sock".to_string(),
        },
        sender_channel: 72,
        initial_window_size: 64 * 1024,
        maximum_packet_size: 16 * 1024,
    })]);
    script
        .wait_for_packet(|p| {
            matches!(
                p,
                Packet::ChannelOpenFailure {
                    recipient: 72,
                    reason: ChannelOpenFailure::AdministrativelyProhibited,
                    ..
                }
            )
        })
        .await;
}

#[tokio::test]
async fn ungranted_x11_and_unknown_channel_types_are_refused() {
    init_logs();
    let (transport, script, stream) = wire();
    script.respond_with(forward_responder);
    script.handshake("SSH-2.0-OpenSSH_9.6");

    let (client, _tcp_rx, _unix_rx, mut x11_rx) = Client::new();
    let _handle = connect_stream(Config::new("testhost", "u"), stream, transport, client)
        .await
        .unwrap();

    script.inject([
        TransportEvent::ChannelOpen(ChannelOpenRequest {
            kind: ChannelOpenKind::X11 {
                originator_address: "10.0.0.1".to_string(),
                originator_port: 6000,
            },
            sender_channel: 80,
            initial_window_size: 4096,
            maximum_packet_size: 4096,
        }),
        TransportEvent::ChannelOpen(ChannelOpenRequest {
            kind: ChannelOpenKind::Unknown {
                typ: "tun@example.com".to_string(),
            },
            sender_channel: 81,
            initial_window_size: 4096,
            maximum_packet_size: 4096,
        }),
    ]);

    script
        .wait_for_packet(|p| {
            matches!(
                p,
                Packet::ChannelOpenFailure {
                    recipient: 80,
                    reason: ChannelOpenFailure::AdministrativelyProhibited,
                    ..
                }
            )
        })
        .await;
    script
        .wait_for_packet(|p| {
            matches!(
                p,
                Packet::ChannelOpenFailure {
                    recipient: 81,
                    reason: ChannelOpenFailure::UnknownChannelType,
                    ..
                }
            )
        })
        .await;
    assert!(x11_rx.try_recv().is_err());
}

#[tokio::test]
async fn vendor_extensions_are_gated_on_the_remote_version() {
    init_logs();
    // An old peer: nothing goes on the wire.
    let (transport, script, stream) = wire();
    script.respond_with(forward_responder);
    script.handshake("SSH-2.0-OpenSSH_4.4");
    let (client, _tcp_rx, _unix_rx, _x11_rx) = Client::new();
    let handle = connect_stream(Config::new("testhost", "u"), stream, transport, client)
        .await
        .unwrap();

    let err = handle.no_more_sessions().await.unwrap_err();
    assert!(matches!(err, Error::VendorMismatch), "{err:?}");
    let err = handle.streamlocal_forward("/tmp/x.sock").await.unwrap_err();
    assert!(matches!(err, Error::VendorMismatch), "{err:?}");
    assert!(!script.sent().iter().any(|p| matches!(
        p,
        Packet::NoMoreSessions { .. } | Packet::StreamLocalForward { .. }
    )));

    // A modern peer: the requests go through.
    let (transport, script, stream) = wire();
    script.respond_with(forward_responder);
    script.handshake("SSH-2.0-OpenSSH_9.6");
    let (client, _tcp_rx, _unix_rx, _x11_rx) = Client::new();
    let handle = connect_stream(Config::new("testhost", "u"), stream, transport, client)
        .await
        .unwrap();
    handle.no_more_sessions().await.unwrap();
    script
        .wait_for_packet(|p| matches!(p, Packet::NoMoreSessions { .. }))
        .await;
}
