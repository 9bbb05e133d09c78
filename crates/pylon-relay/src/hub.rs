//! Connection registry and envelope routing.
//!
//! The hub owns one entry per live connection, keyed by connection id
//! rather than device id, so two sockets claiming the same device id
//! coexist until one closes (last-registered-wins at the consumer).
//! Routed application payloads are forwarded verbatim; only synthesized
//! diagnostic replies carry the relay's `from` and `timestamp`.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use pylon_core::{
    BroadcastClass, DeviceRef, DeviceType, Envelope, now_millis,
    envelope::types,
};

/// One registered device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub device_type: DeviceType,
    /// Unix millis at registration.
    pub connected_at: i64,
}

struct Connection {
    tx: mpsc::UnboundedSender<String>,
    device: Option<Device>,
}

/// Central routing hub. One instance per relay process.
#[derive(Default)]
pub struct RelayHub {
    connections: Mutex<HashMap<Uuid, Connection>>,
}

impl RelayHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection; its outbound messages go through `tx`.
    pub fn connect(&self, tx: mpsc::UnboundedSender<String>) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.connections
            .lock()
            .unwrap()
            .insert(conn_id, Connection { tx, device: None });
        tracing::debug!("Connection {conn_id} opened");
        conn_id
    }

    /// Drop a connection. If it had registered, the device list is
    /// re-broadcast.
    pub fn disconnect(&self, conn_id: Uuid) {
        let registered = {
            let mut connections = self.connections.lock().unwrap();
            connections
                .remove(&conn_id)
                .is_some_and(|c| c.device.is_some())
        };
        tracing::debug!("Connection {conn_id} closed");
        if registered {
            self.broadcast_device_status();
        }
    }

    /// Registered devices, oldest first.
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .connections
            .lock()
            .unwrap()
            .values()
            .filter_map(|c| c.device.clone())
            .collect();
        devices.sort_by_key(|d| d.connected_at);
        devices
    }

    /// Handle one inbound text frame from a connection.
    ///
    /// Malformed JSON replies with an `error` envelope to the sender
    /// only; the connection survives.
    pub fn handle_text(&self, conn_id: Uuid, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("Malformed envelope from {conn_id}: {e}");
                self.send_to(conn_id, &Envelope::error(format!("Invalid message: {e}")));
                return;
            }
        };

        match envelope.kind.as_str() {
            types::IDENTIFY | types::AUTH => self.register(conn_id, &envelope),
            types::ECHO => {
                let mut reply = Envelope::with_payload(types::ECHO, envelope.payload).stamped();
                reply.from = Some(DeviceRef::relay());
                self.send_to(conn_id, &reply);
            }
            types::PING => {
                let mut reply = Envelope::new(types::PONG).stamped();
                reply.from = Some(DeviceRef::relay());
                self.send_to(conn_id, &reply);
            }
            types::GET_DEVICES => {
                let mut reply = Envelope::with_payload(
                    types::DEVICE_LIST,
                    serde_json::json!({ "devices": self.devices() }),
                )
                .stamped();
                reply.from = Some(DeviceRef::relay());
                self.send_to(conn_id, &reply);
            }
            _ => self.route(conn_id, &envelope, text),
        }
    }

    /// Register a connection as a device and announce the new list.
    fn register(&self, conn_id: Uuid, envelope: &Envelope) {
        let device_id = envelope.payload["deviceId"].as_str().unwrap_or_default();
        if device_id.is_empty() {
            self.send_to(conn_id, &Envelope::error("identify requires a deviceId"));
            return;
        }
        let device_type = serde_json::from_value::<DeviceType>(
            envelope.payload["deviceType"].clone(),
        )
        .unwrap_or(DeviceType::Desktop);

        let device = Device {
            device_id: device_id.to_string(),
            device_type,
            connected_at: now_millis(),
        };
        tracing::info!("Registered {device_type} {device_id} on {conn_id}");

        if let Some(conn) = self.connections.lock().unwrap().get_mut(&conn_id) {
            conn.device = Some(device.clone());
        }

        self.send_to(
            conn_id,
            &Envelope::with_payload(
                types::REGISTERED,
                serde_json::json!({
                    "deviceId": device.device_id,
                    "deviceType": device.device_type,
                }),
            )
            .stamped(),
        );
        self.broadcast_device_status();
    }

    /// Forward an envelope verbatim per the routing rules.
    ///
    /// Only registered connections may route: an unregistered sender is
    /// answered with an `error` envelope, and class broadcasts are
    /// delivered to registered connections only. Synthesized
    /// diagnostics (`echo`, `ping`, `getDevices`) stay available before
    /// identify.
    fn route(&self, sender: Uuid, envelope: &Envelope, raw: &str) {
        let connections = self.connections.lock().unwrap();

        let sender_registered = connections
            .get(&sender)
            .is_some_and(|c| c.device.is_some());
        if !sender_registered {
            drop(connections);
            tracing::debug!("Dropping {} from unregistered {sender}", envelope.kind);
            self.send_to(sender, &Envelope::error("Not registered: identify first"));
            return;
        }

        if let Some(target) = &envelope.to {
            for conn in connections.values() {
                let matches = conn
                    .device
                    .as_ref()
                    .is_some_and(|d| d.device_id == target.device_id);
                if matches {
                    let _ = conn.tx.send(raw.to_string());
                }
            }
            return;
        }

        for (id, conn) in connections.iter() {
            if *id == sender {
                continue;
            }
            let in_class = match envelope.broadcast {
                Some(BroadcastClass::Pylons) => conn
                    .device
                    .as_ref()
                    .is_some_and(|d| d.device_type == DeviceType::Pylon),
                Some(BroadcastClass::All) | None => conn.device.is_some(),
            };
            if in_class {
                // A closed receiver just means the socket is going away.
                let _ = conn.tx.send(raw.to_string());
            }
        }
    }

    /// Push the full device list to every connection, registered or not.
    fn broadcast_device_status(&self) {
        let envelope = Envelope::with_payload(
            types::DEVICE_STATUS,
            serde_json::json!({ "devices": self.devices() }),
        )
        .stamped();
        let Ok(json) = serde_json::to_string(&envelope) else {
            return;
        };
        for conn in self.connections.lock().unwrap().values() {
            let _ = conn.tx.send(json.clone());
        }
    }

    fn send_to(&self, conn_id: Uuid, envelope: &Envelope) {
        match serde_json::to_string(envelope) {
            Ok(json) => {
                if let Some(conn) = self.connections.lock().unwrap().get(&conn_id) {
                    let _ = conn.tx.send(json);
                }
            }
            Err(e) => tracing::error!("Failed to serialize envelope: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identify(device_id: &str, device_type: &str) -> String {
        serde_json::json!({
            "type": "identify",
            "payload": { "deviceId": device_id, "deviceType": device_type },
        })
        .to_string()
    }

    fn open(hub: &RelayHub) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (hub.connect(tx), rx)
    }

    fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Envelope {
        serde_json::from_str(&rx.try_recv().expect("expected a frame")).unwrap()
    }

    #[tokio::test]
    async fn identify_registers_and_broadcasts_device_status() {
        let hub = RelayHub::new();
        let (pylon, mut pylon_rx) = open(&hub);
        let (desktop, mut desktop_rx) = open(&hub);

        hub.handle_text(pylon, &identify("42", "pylon"));

        let registered = next(&mut pylon_rx);
        assert_eq!(registered.kind, "registered");
        assert_eq!(registered.payload["deviceId"], "42");
        assert!(registered.timestamp.is_some());

        // Both connections see the deviceStatus, even the unregistered one.
        let status = next(&mut pylon_rx);
        assert_eq!(status.kind, "deviceStatus");
        assert_eq!(status.payload["devices"][0]["deviceId"], "42");
        assert_eq!(next(&mut desktop_rx).kind, "deviceStatus");

        // auth registers too.
        hub.handle_text(desktop, &identify("d1", "desktop"));
        assert_eq!(next(&mut desktop_rx).kind, "registered");
    }

    #[tokio::test]
    async fn addressed_envelope_reaches_only_the_target() {
        let hub = RelayHub::new();
        let (pylon, mut pylon_rx) = open(&hub);
        let (desktop, mut desktop_rx) = open(&hub);
        let (other, mut other_rx) = open(&hub);
        hub.handle_text(pylon, &identify("42", "pylon"));
        hub.handle_text(desktop, &identify("d1", "desktop"));
        hub.handle_text(other, &identify("d2", "desktop"));
        while pylon_rx.try_recv().is_ok() {}
        while desktop_rx.try_recv().is_ok() {}
        while other_rx.try_recv().is_ok() {}

        let raw = serde_json::json!({
            "type": "claude_send",
            "payload": { "message": "hi" },
            "to": { "deviceId": "42", "deviceType": "pylon" },
        })
        .to_string();
        hub.handle_text(desktop, &raw);

        // Forwarded verbatim: no relay timestamp added.
        let delivered: Envelope = serde_json::from_str(&pylon_rx.try_recv().unwrap()).unwrap();
        assert_eq!(delivered.kind, "claude_send");
        assert!(delivered.timestamp.is_none());
        assert!(other_rx.try_recv().is_err());
        assert!(desktop_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn class_broadcast_excludes_sender_and_non_members() {
        let hub = RelayHub::new();
        let (pylon, mut pylon_rx) = open(&hub);
        let (desktop, mut desktop_rx) = open(&hub);
        let (sender, mut sender_rx) = open(&hub);
        hub.handle_text(pylon, &identify("42", "pylon"));
        hub.handle_text(desktop, &identify("d1", "desktop"));
        hub.handle_text(sender, &identify("d2", "desktop"));
        while pylon_rx.try_recv().is_ok() {}
        while desktop_rx.try_recv().is_ok() {}
        while sender_rx.try_recv().is_ok() {}

        let raw = serde_json::json!({
            "type": "notification",
            "payload": { "text": "hello pylons" },
            "broadcast": "pylons",
        })
        .to_string();
        hub.handle_text(sender, &raw);

        assert_eq!(next(&mut pylon_rx).kind, "notification");
        assert!(desktop_rx.try_recv().is_err());
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn default_routing_is_all_registered_but_sender() {
        let hub = RelayHub::new();
        let (a, mut a_rx) = open(&hub);
        let (b, mut b_rx) = open(&hub);
        let (_lurker, mut lurker_rx) = open(&hub);
        hub.handle_text(a, &identify("d1", "desktop"));
        hub.handle_text(b, &identify("d2", "desktop"));
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}
        while lurker_rx.try_recv().is_ok() {}

        hub.handle_text(a, &serde_json::json!({"type": "chat", "payload": {}}).to_string());
        assert!(a_rx.try_recv().is_err());
        assert_eq!(next(&mut b_rx).kind, "chat");
        // Connections that never identified get nothing.
        assert!(lurker_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregistered_sender_cannot_route() {
        let hub = RelayHub::new();
        let (a, mut a_rx) = open(&hub);
        let (b, mut b_rx) = open(&hub);
        hub.handle_text(b, &identify("42", "pylon"));
        while b_rx.try_recv().is_ok() {}

        hub.handle_text(
            a,
            &serde_json::json!({
                "type": "claude_send",
                "payload": { "message": "hi" },
                "to": { "deviceId": "42", "deviceType": "pylon" },
            })
            .to_string(),
        );
        assert_eq!(next(&mut a_rx).kind, "error");
        assert!(b_rx.try_recv().is_err());

        // Registering unblocks routing on the same connection.
        hub.handle_text(a, &identify("d1", "desktop"));
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}
        hub.handle_text(
            a,
            &serde_json::json!({
                "type": "claude_send",
                "payload": { "message": "hi" },
                "to": { "deviceId": "42", "deviceType": "pylon" },
            })
            .to_string(),
        );
        assert_eq!(next(&mut b_rx).kind, "claude_send");
    }

    #[tokio::test]
    async fn malformed_json_replies_error_to_sender_only() {
        let hub = RelayHub::new();
        let (a, mut a_rx) = open(&hub);
        let (_b, mut b_rx) = open(&hub);

        hub.handle_text(a, "{not json");
        assert_eq!(next(&mut a_rx).kind, "error");
        assert!(b_rx.try_recv().is_err());

        // The connection keeps working afterwards.
        hub.handle_text(a, &serde_json::json!({"type": "ping"}).to_string());
        assert_eq!(next(&mut a_rx).kind, "pong");
    }

    #[tokio::test]
    async fn synthesized_replies_carry_relay_from_and_timestamp() {
        let hub = RelayHub::new();
        let (a, mut a_rx) = open(&hub);

        hub.handle_text(
            a,
            &serde_json::json!({"type": "echo", "payload": {"n": 7}}).to_string(),
        );
        let echo = next(&mut a_rx);
        assert_eq!(echo.kind, "echo");
        assert_eq!(echo.payload["n"], 7);
        assert_eq!(echo.from.unwrap().device_id, "relay");
        assert!(echo.timestamp.is_some());

        hub.handle_text(a, &serde_json::json!({"type": "getDevices"}).to_string());
        let list = next(&mut a_rx);
        assert_eq!(list.kind, "deviceList");
        assert_eq!(list.payload["devices"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn disconnect_removes_device_and_reannounces() {
        let hub = RelayHub::new();
        let (pylon, mut pylon_rx) = open(&hub);
        let (_watcher, mut watcher_rx) = open(&hub);
        hub.handle_text(pylon, &identify("42", "pylon"));
        while pylon_rx.try_recv().is_ok() {}
        while watcher_rx.try_recv().is_ok() {}

        hub.disconnect(pylon);
        let status = next(&mut watcher_rx);
        assert_eq!(status.kind, "deviceStatus");
        assert!(status.payload["devices"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_device_ids_coexist_until_one_closes() {
        let hub = RelayHub::new();
        let (first, _first_rx) = open(&hub);
        let (second, _second_rx) = open(&hub);
        hub.handle_text(first, &identify("42", "pylon"));
        hub.handle_text(second, &identify("42", "pylon"));

        assert_eq!(hub.devices().len(), 2);
        hub.disconnect(first);
        assert_eq!(hub.devices().len(), 1);
    }
}
