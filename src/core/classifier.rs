//! Coarse traffic categorization from destination port and direction.

use serde::Serialize;

/// Category attached to every emitted packet record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficCategory {
    Client,
    Server,
    Db,
}

/// Classifies packets as client/server/db traffic.
///
/// Database ports win over direction; otherwise outbound packets are
/// `client` traffic and inbound packets are `server` traffic.
pub struct TrafficClassifier {
    db_ports: Vec<u16>,
}

impl TrafficClassifier {
    /// Build a classifier from a comma-separated port list such as
    /// `"3306,6379,5432"`. Malformed or out-of-range entries are skipped.
    pub fn new(db_ports: &str) -> Self {
        Self {
            db_ports: parse_ports(db_ports),
        }
    }

    pub fn classify(&self, dst_port: u16, is_outbound: bool) -> TrafficCategory {
        if self.db_ports.contains(&dst_port) {
            TrafficCategory::Db
        } else if is_outbound {
            TrafficCategory::Client
        } else {
            TrafficCategory::Server
        }
    }

    pub fn db_ports(&self) -> &[u16] {
        &self.db_ports
    }
}

fn parse_ports(port_str: &str) -> Vec<u16> {
    port_str
        .split(',')
        .filter_map(|item| item.trim().parse::<u16>().ok())
        .filter(|&p| p >= 1)
        .collect()
}
