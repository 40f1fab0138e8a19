// Per-interface endpoint aggregation for one capture session

use crate::capture::{PacketRecord, ProtocolFamily};
use crate::ifaces::NetworkInterface;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Wire format for capture timestamps, millisecond precision with offset.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

/// Identity of one directional flow as captured.
///
/// Direction is deliberately not canonicalized: A->B and B->A are two keys,
/// because tcpdump reports them as separate lines and the UI shows both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EndpointKey {
    family: ProtocolFamily,
    source: Ipv4Addr,
    source_port: u16,
    destination: Ipv4Addr,
    dest_port: u16,
}

/// Running counters for one directional flow.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointAggregate {
    pub family: ProtocolFamily,
    pub source: Ipv4Addr,
    #[serde(rename = "dest")]
    pub destination: Ipv4Addr,
    #[serde(rename = "sport", skip_serializing_if = "port_is_zero")]
    pub source_port: u16,
    #[serde(rename = "dport", skip_serializing_if = "port_is_zero")]
    pub dest_port: u16,
    pub packets: u64,
    pub bytes: u64,
}

fn port_is_zero(port: &u16) -> bool {
    *port == 0
}

impl EndpointAggregate {
    fn key(&self) -> EndpointKey {
        EndpointKey {
            family: self.family,
            source: self.source,
            source_port: self.source_port,
            destination: self.destination,
            dest_port: self.dest_port,
        }
    }
}

/// All endpoints observed on one local interface, in first-seen order until
/// [`CaptureSummary::finish`] sorts them by traffic.
#[derive(Debug, Serialize)]
pub struct InterfaceSummary {
    #[serde(rename = "iface")]
    pub interface: NetworkInterface,
    pub endpoints: Vec<EndpointAggregate>,
    /// Lookup into `endpoints` for O(1) accumulation.
    #[serde(skip)]
    index: HashMap<EndpointKey, usize>,
}

impl InterfaceSummary {
    fn new(interface: NetworkInterface) -> Self {
        Self {
            interface,
            endpoints: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn accumulate(&mut self, record: &PacketRecord) {
        let key = EndpointKey {
            family: record.family,
            source: record.source,
            source_port: record.source_port,
            destination: record.destination,
            dest_port: record.dest_port,
        };
        let idx = *self.index.entry(key).or_insert_with(|| {
            self.endpoints.push(EndpointAggregate {
                family: record.family,
                source: record.source,
                destination: record.destination,
                source_port: record.source_port,
                dest_port: record.dest_port,
                packets: 0,
                bytes: 0,
            });
            self.endpoints.len() - 1
        });

        let endpoint = &mut self.endpoints[idx];
        endpoint.packets += 1;
        endpoint.bytes += record.length;
    }

    fn sort_by_traffic(&mut self) {
        // Stable sort: endpoints with equal packet counts keep first-seen order.
        self.endpoints.sort_by(|a, b| b.packets.cmp(&a.packets));
        self.index = self
            .endpoints
            .iter()
            .enumerate()
            .map(|(idx, endpoint)| (endpoint.key(), idx))
            .collect();
    }
}

/// Aggregate of one capture session.
///
/// The local-address index is built once from the interface directory snapshot
/// taken at session start and never refreshed mid-session.
#[derive(Debug, Serialize)]
pub struct CaptureSummary {
    #[serde(
        rename = "start",
        serialize_with = "serialize_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "end",
        serialize_with = "serialize_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(rename = "ifaces")]
    pub interfaces: HashMap<String, InterfaceSummary>,
    /// Local IPv4 address -> owning interface.
    #[serde(skip)]
    ipv4_interfaces: HashMap<Ipv4Addr, NetworkInterface>,
}

fn serialize_time<S>(time: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match time {
        Some(time) => serializer.serialize_str(&time.format(TIME_FORMAT).to_string()),
        None => serializer.serialize_none(),
    }
}

impl CaptureSummary {
    pub fn new(directory: Vec<NetworkInterface>) -> Self {
        let mut ipv4_interfaces = HashMap::new();
        for interface in directory {
            if let Some(addr) = interface.ipv4 {
                ipv4_interfaces.insert(addr, interface);
            }
        }
        Self {
            start_time: None,
            end_time: None,
            interfaces: HashMap::new(),
            ipv4_interfaces,
        }
    }

    /// Fold one parsed record into the aggregate.
    pub fn on_packet(&mut self, record: &PacketRecord) {
        // A packet without payload carries no traffic signal (pure ACKs).
        if record.length == 0 {
            return;
        }

        // Only packets touching a directly-owned interface are relevant.
        // A source match wins over a destination match.
        let Some(interface) = self
            .ipv4_interfaces
            .get(&record.source)
            .or_else(|| self.ipv4_interfaces.get(&record.destination))
        else {
            return;
        };

        match self.start_time {
            None => {
                self.start_time = Some(record.timestamp);
                self.end_time = Some(record.timestamp);
            }
            Some(start) => {
                if record.timestamp < start {
                    self.start_time = Some(record.timestamp);
                }
                if self.end_time.is_some_and(|end| record.timestamp > end) {
                    self.end_time = Some(record.timestamp);
                }
            }
        }

        self.interfaces
            .entry(interface.name.clone())
            .or_insert_with(|| InterfaceSummary::new(interface.clone()))
            .accumulate(record);
    }

    /// Finalize the session: order each interface's endpoints by descending
    /// packet count. Safe to call more than once.
    pub fn finish(&mut self) {
        for summary in self.interfaces.values_mut() {
            summary.sort_by_traffic();
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "start={:?}, end={:?}, ifaces={}",
            self.start_time.map(|t| t.format(TIME_FORMAT).to_string()),
            self.end_time.map(|t| t.format(TIME_FORMAT).to_string()),
            self.interfaces.len()
        )
    }
}
