//! Hijack module
//!
//! A task that scans stored captures for hijacks against one entity: any
//! capture advertising a prefix the entity owns (enforced by the subnet
//! filter on the read stream) whose AS path contains none of the entity's
//! owned origin ASes counts as an event. The scan mutates nothing; the
//! result is reported through the logger.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::db::{Capture, CaptureFilter, Entity, EntityFilter, ReadFilter, Record};
use crate::error::{Error, Result};
use crate::modules::{Module, ModuleCtx, ModuleHandler, ModuleInfo, ModuleKind};
use crate::server::BgpmondServer;
use crate::util::{check_for_keys, OptMap};

pub fn handler() -> ModuleHandler {
    ModuleHandler {
        info: ModuleInfo {
            type_name: "hijack".to_string(),
            kind: ModuleKind::Task,
            description: "Scan for BGP hijacks".to_string(),
            opts: "entity: the name of the entity to search for hijacks on\n\
                   session: the ID of the session to read captures from\n\
                   start: the timestamp to start reading from\n\
                   end: the timestamp to read to"
                .to_string(),
        },
        maker: Arc::new(|server| Box::new(HijackModule { server })),
    }
}

struct HijackModule {
    server: Arc<dyn BgpmondServer>,
}

#[async_trait]
impl Module for HijackModule {
    async fn run(self: Box<Self>, args: OptMap, _ctx: ModuleCtx) -> Result<()> {
        if !check_for_keys(&args, &["entity", "session", "start", "end"]) {
            return Err(Error::parse(
                "hijack needs entity, session, start, and end keys",
            ));
        }

        let session = &args["session"];
        let start = parse_time(&args["start"])?;
        let end = parse_time(&args["end"])?;

        let entity = self.read_entity(session, &args["entity"]).await?;
        info!(entity = %entity.name, "scanning for hijacks");

        // Only captures advertising one of the entity's owned prefixes can
        // qualify, so let the store filter on subnet overlap.
        let filter = CaptureFilter::new(None, start, end)
            .allow_subnets(entity.owned_prefixes.clone());
        let mut captures = self
            .server
            .open_read_stream(session, ReadFilter::Capture(filter))
            .await?;

        let mut scanned: u64 = 0;
        let mut events: u64 = 0;
        while captures.read().await {
            if let Some(Record::Capture(cap)) = captures.data() {
                scanned += 1;
                if is_event(&entity, &cap) {
                    events += 1;
                }
            }
        }

        let err = captures.err();
        captures.close();
        if let Some(err) = err {
            return Err(err);
        }

        info!(scanned, events, entity = %entity.name, "hijack scan finished");
        Ok(())
    }
}

impl HijackModule {
    async fn read_entity(&self, session: &str, name: &str) -> Result<Entity> {
        let filter = EntityFilter {
            name: Some(name.to_string()),
        };
        let mut stream = self
            .server
            .open_read_stream(session, ReadFilter::Entity(filter))
            .await?;

        if !stream.read().await {
            let err = stream.err();
            stream.close();
            return Err(err.unwrap_or_else(|| Error::not_found(format!("entity {}", name))));
        }

        let record = stream.data();
        stream.close();
        match record {
            Some(Record::Entity(entity)) => Ok(entity),
            _ => Err(Error::programmer("entity stream yielded a non-entity")),
        }
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    dateparser::parse(s).map_err(|_| Error::parse(format!("unable to parse time string: {}", s)))
}

/// A capture is an event when its AS path contains none of the entity's
/// owned origins.
fn is_event(entity: &Entity, capture: &Capture) -> bool {
    !entity
        .owned_origins
        .iter()
        .any(|own| capture.as_path.contains(own))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::IpAddr;

    fn entity() -> Entity {
        Entity {
            name: "acme".to_string(),
            email: "noc@acme.example".to_string(),
            owned_origins: vec![64500],
            owned_prefixes: vec!["10.0.0.0/8".parse().unwrap()],
        }
    }

    fn capture(as_path: Vec<i32>, advertised: &str) -> Capture {
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        Capture {
            update_id: "u1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2013, 1, 1, 12, 30, 0).unwrap(),
            collector_ip: ip,
            peer_ip: ip,
            as_path,
            next_hop: ip,
            origin_as: 0,
            advertised: vec![advertised.parse().unwrap()],
            withdrawn: Vec::new(),
            protomsg: Vec::new(),
        }
    }

    #[test]
    fn test_owned_origin_in_path_is_no_event() {
        assert!(!is_event(&entity(), &capture(vec![64501, 64500], "10.1.0.0/16")));
    }

    #[test]
    fn test_foreign_path_is_event() {
        assert!(is_event(&entity(), &capture(vec![64501, 64502], "10.2.0.0/16")));
    }

    #[test]
    fn test_empty_path_is_event() {
        assert!(is_event(&entity(), &capture(Vec::new(), "10.2.0.0/16")));
    }

    #[test]
    fn test_parse_time() {
        assert!(parse_time("2013-01-01T00:00:00Z").is_ok());
        assert!(parse_time("not a time").is_err());
    }
}
