use {
    super::GroupAddr,
    anyhow::Result,
    std::{net::IpAddr, sync::Mutex},
};

pub const SERVICE_RTP: &str = "_rtp._udp";
pub const SERVICE_OPUS: &str = "_opus._udp";
pub const SERVICE_CONTROL: &str = "_ka9q-ctl._udp";

/// One service record as handed to the zeroconf responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service_type: &'static str,
    pub instance: String,
    pub dns_name: String,
    pub port: u16,
    pub txt: Vec<String>,
    /// Address record; present only for synthesized groups, where no
    /// DNS answer exists to point at.
    pub address: Option<IpAddr>,
}

/// Publisher contract. The mDNS responder is an external collaborator;
/// the daemon only describes what to publish.
pub trait ServiceAnnouncer: Send + Sync {
    fn announce(&self, record: ServiceRecord) -> Result<()>;
}

/// Default announcer: retains and logs the records. Tests inspect it;
/// a responder bridge replays it.
#[derive(Debug, Default)]
pub struct RecordRegistry {
    records: Mutex<Vec<ServiceRecord>>,
}

impl RecordRegistry {
    pub fn new() -> RecordRegistry {
        RecordRegistry::default()
    }

    pub fn records(&self) -> Vec<ServiceRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ServiceAnnouncer for RecordRegistry {
    fn announce(&self, record: ServiceRecord) -> Result<()> {
        log::debug!(
            "advertising {} {} at {}:{}{}",
            record.service_type,
            record.instance,
            record.dns_name,
            record.port,
            match record.address {
                Some(addr) => format!(" ({addr})"),
                None => String::new(),
            }
        );
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}

/// Publishes the record for an advertised group: always the service
/// record with its `TTL=` TXT attribute, plus an address record when
/// the address was synthesized rather than resolved.
pub fn advertise(
    announcer: &dyn ServiceAnnouncer,
    service_type: &'static str,
    instance: &str,
    group: &GroupAddr,
    ttl: u8,
) -> Result<()> {
    announcer.announce(ServiceRecord {
        service_type,
        instance: instance.to_string(),
        dns_name: group.name.clone(),
        port: group.addr.port(),
        txt: vec![format!("TTL={ttl}")],
        address: group.synthesized.then(|| group.addr.ip()),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::multicast::resolve_group;

    #[test]
    fn synthesized_groups_get_address_records() {
        let registry = RecordRegistry::new();
        let group = resolve_group("hf-pcm", 5004, false);
        advertise(&registry, SERVICE_RTP, "radio hf", &group, 2).unwrap();

        let records = registry.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].service_type, SERVICE_RTP);
        assert_eq!(records[0].txt, vec!["TTL=2".to_string()]);
        assert_eq!(records[0].address, Some(group.addr.ip()));
    }
}
