//! Translator-wide state: one independent table per protocol class

use super::clock::{Clock, SystemClock};
use super::list::MapList;
use super::portset::PortSet;
use super::table::{MappingEntry, MappingTable};
use super::MapError;
use crate::telemetry::MetricsRegistry;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Protocol classes with their own mapping table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Icmp,
}

impl Protocol {
    /// Map an IP protocol number to its table
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Protocol::Icmp),
            17 => Some(Protocol::Udp),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

/// Parameters fixed for the lifetime of a service
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub ports: PortSet,
    pub udp_timeout: Duration,
    pub icmp_timeout: Duration,
    pub max_entries: Option<usize>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            ports: PortSet::default(),
            udp_timeout: Duration::from_secs(15),
            icmp_timeout: Duration::from_secs(15),
            max_entries: None,
        }
    }
}

/// Running translator mapping state
pub struct MapService {
    udp: MapList,
    icmp: MapList,
    ports: PortSet,
    metrics: Arc<MetricsRegistry>,
}

impl MapService {
    /// Build both tables with the system clock
    pub fn start(settings: &ServiceSettings) -> Self {
        Self::start_with_clock(settings, Arc::new(SystemClock))
    }

    /// Build both tables sharing `clock`
    pub fn start_with_clock(settings: &ServiceSettings, clock: Arc<dyn Clock>) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let build = |protocol: Protocol, timeout: Duration| {
            let mut table = MappingTable::new(timeout);
            if let Some(max) = settings.max_entries {
                table = table.with_max_entries(max);
            }
            MapList::with_parts(
                table,
                clock.clone(),
                StdRng::from_os_rng(),
                metrics.register_table(protocol.name()),
            )
        };

        let service = Self {
            udp: build(Protocol::Udp, settings.udp_timeout),
            icmp: build(Protocol::Icmp, settings.icmp_timeout),
            ports: settings.ports,
            metrics,
        };

        info!(
            "Mapping started: ratio={} adjacent={} offset={} start_port={} capacity={}",
            settings.ports.ratio,
            settings.ports.adjacent,
            settings.ports.offset,
            settings.ports.start_port(),
            settings.ports.capacity()
        );
        service
    }

    pub fn ports(&self) -> PortSet {
        self.ports
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Table of one protocol class
    pub fn table(&self, protocol: Protocol) -> &MapList {
        match protocol {
            Protocol::Udp => &self.udp,
            Protocol::Icmp => &self.icmp,
        }
    }

    /// Translated port for an outbound flow, using the configured port set
    pub fn resolve_outbound(
        &self,
        protocol: Protocol,
        old_addr: Ipv4Addr,
        old_port: u16,
        dst_addr: Ipv4Addr,
    ) -> Result<u16, MapError> {
        self.table(protocol)
            .resolve_outbound(old_addr, old_port, dst_addr, &self.ports)
    }

    /// Original endpoint for an inbound flow
    pub fn resolve_inbound(
        &self,
        protocol: Protocol,
        new_port: u16,
        dst_addr: Ipv4Addr,
    ) -> Result<(Ipv4Addr, u16), MapError> {
        self.table(protocol).resolve_inbound(new_port, dst_addr)
    }

    /// Copy of every live entry of one table
    pub fn snapshot(&self, protocol: Protocol) -> Vec<MappingEntry> {
        self.table(protocol).snapshot()
    }

    /// Tear down both tables; returns the number of dropped entries
    pub fn stop(&self) -> usize {
        let udp = self.udp.flush();
        let icmp = self.icmp.flush();
        info!("Mapping stopped: dropped {} udp and {} icmp maps", udp, icmp);
        udp + icmp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::clock::ManualClock;

    #[test]
    fn test_protocol_from_u8() {
        assert_eq!(Protocol::from_u8(17), Some(Protocol::Udp));
        assert_eq!(Protocol::from_u8(1), Some(Protocol::Icmp));
        assert_eq!(Protocol::from_u8(6), None);
    }

    #[test]
    fn test_tables_are_independent() {
        let settings = ServiceSettings {
            ports: PortSet::new(2, 1024, 0),
            ..Default::default()
        };
        let service = MapService::start(&settings);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(8, 8, 8, 8);

        let port = service
            .resolve_outbound(Protocol::Udp, src, 5000, dst)
            .unwrap();
        assert_eq!(service.table(Protocol::Udp).len(), 1);
        assert!(service.table(Protocol::Icmp).is_empty());
        assert_eq!(
            service.resolve_inbound(Protocol::Icmp, port, dst),
            Err(MapError::NotFound)
        );
        assert_eq!(
            service.resolve_inbound(Protocol::Udp, port, dst),
            Ok((src, 5000))
        );
    }

    #[test]
    fn test_per_protocol_timeouts() {
        let clock = Arc::new(ManualClock::new());
        let settings = ServiceSettings {
            ports: PortSet::new(2, 1024, 0),
            udp_timeout: Duration::from_secs(30),
            icmp_timeout: Duration::from_secs(10),
            max_entries: None,
        };
        let service = MapService::start_with_clock(&settings, clock.clone());
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(8, 8, 8, 8);

        let udp = service.resolve_outbound(Protocol::Udp, src, 5000, dst).unwrap();
        let icmp = service.resolve_outbound(Protocol::Icmp, src, 77, dst).unwrap();

        clock.advance(Duration::from_secs(20));
        assert!(service.resolve_inbound(Protocol::Udp, udp, dst).is_ok());
        assert_eq!(
            service.resolve_inbound(Protocol::Icmp, icmp, dst),
            Err(MapError::NotFound)
        );
    }

    #[test]
    fn test_stop_flushes_everything() {
        let service = MapService::start(&ServiceSettings::default());
        let dst = Ipv4Addr::new(8, 8, 8, 8);
        for i in 1..=3 {
            service
                .resolve_outbound(
                    Protocol::Udp,
                    Ipv4Addr::new(10, 0, 0, i),
                    5000 + u16::from(i),
                    dst,
                )
                .unwrap();
        }
        service
            .resolve_outbound(Protocol::Icmp, Ipv4Addr::new(10, 0, 0, 1), 2000, dst)
            .unwrap();

        assert_eq!(service.stop(), 4);
        assert!(service.snapshot(Protocol::Udp).is_empty());
        assert!(service.snapshot(Protocol::Icmp).is_empty());
        assert!(service
            .metrics()
            .export()
            .contains(&("udp_table_size".into(), 0)));
    }
}
