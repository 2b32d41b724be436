//! Routing of packets received from the server

use crate::network::Client;
use log::{debug, info};
use shared::Packet;

/// Application hook for everything except heartbeat probes
///
/// Runs on the receive task without any session lock held, so it may call
/// back into the [`Client`], including [`Client::disconnect`].
pub trait ClientPacketHandler: Send + Sync {
    fn handle(&self, packet: &Packet, client: &Client);
}

impl<F> ClientPacketHandler for F
where
    F: Fn(&Packet, &Client) + Send + Sync,
{
    fn handle(&self, packet: &Packet, client: &Client) {
        self(packet, client)
    }
}

pub(crate) fn route(client: &Client, packet: Packet) {
    match packet {
        Packet::Heartbeat { timestamp } => client.answer_heartbeat(timestamp),
        other => {
            if let Some(handler) = client.handler() {
                handler.handle(&other, client);
            }
        }
    }
}

/// Prints relayed chat to stdout and leaves when the server says goodbye.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChatPrinter;

impl ClientPacketHandler for ChatPrinter {
    fn handle(&self, packet: &Packet, client: &Client) {
        match packet {
            Packet::Connect { player_name } => {
                println!("Joined as {}", player_name);
            }
            Packet::Message { text } => println!("{}", text),
            Packet::Disconnect => {
                info!("Server closed the session");
                client.disconnect();
            }
            other => debug!("Ignoring {:?} from server", other.packet_type()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_heartbeat_is_not_forwarded() {
        let client = Client::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.set_handler(move |packet: &Packet, _: &Client| {
            sink.lock().unwrap().push(packet.clone());
        });

        route(&client, Packet::Heartbeat { timestamp: 1234 });
        route(&client, Packet::Message { text: "hey".to_string() });

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Packet::Message {
                text: "hey".to_string()
            }]
        );
        assert_eq!(client.time(), 1234);
        assert_eq!(client.last_heartbeat(), 1234);
    }

    #[test]
    fn test_cleared_handler_receives_nothing() {
        let client = Client::new();
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        client.set_handler(move |_: &Packet, _: &Client| {
            *counter.lock().unwrap() += 1;
        });
        client.clear_handler();

        route(&client, Packet::Disconnect);

        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn test_printer_tolerates_disconnect_without_session() {
        let client = Client::new();
        ChatPrinter.handle(&Packet::Disconnect, &client);
        assert!(!client.is_connected());
    }
}
