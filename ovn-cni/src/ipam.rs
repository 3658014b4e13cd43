use std::collections::HashMap;
use std::sync::Mutex;

use ipnetwork::IpNetwork;

use crate::{Result, util};

/// Per-subnet view of the address space, fed by the subnet workers. The
/// lock is map-granular; every invariant is per subnet.
#[derive(Default)]
pub struct Ipam {
    subnets: Mutex<HashMap<String, SubnetRange>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubnetRange {
    pub cidrs: Vec<IpNetwork>,
    pub exclude_ips: Vec<String>,
}

impl Ipam {
    pub fn add_or_update_subnet(
        &self,
        name: &str,
        cidr_block: &str,
        exclude_ips: &[String],
    ) -> Result<()> {
        let range = SubnetRange {
            cidrs: util::parse_cidrs(cidr_block)?,
            exclude_ips: util::expand_exclude_ips(exclude_ips),
        };
        self.subnets
            .lock()
            .expect("ipam lock poisoned")
            .insert(name.to_string(), range);
        Ok(())
    }

    pub fn delete_subnet(&self, name: &str) {
        self.subnets
            .lock()
            .expect("ipam lock poisoned")
            .remove(name);
    }

    pub fn get_subnet(&self, name: &str) -> Option<SubnetRange> {
        self.subnets
            .lock()
            .expect("ipam lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains_subnet(&self, name: &str) -> bool {
        self.subnets
            .lock()
            .expect("ipam lock poisoned")
            .contains_key(name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_add_update_delete() {
        let ipam = Ipam::default();
        ipam.add_or_update_subnet("s1", "10.16.0.0/16", &["10.16.0.1".to_string()])
            .expect("valid cidr");
        assert!(ipam.contains_subnet("s1"));

        ipam.add_or_update_subnet(
            "s1",
            "10.16.0.0/16",
            &["10.16.0.1".to_string(), "10.16.0.2..10.16.0.3".to_string()],
        )
        .expect("valid cidr");
        let range = ipam.get_subnet("s1").expect("indexed subnet");
        assert_eq!(range.exclude_ips, vec!["10.16.0.1", "10.16.0.2", "10.16.0.3"]);

        ipam.delete_subnet("s1");
        assert!(!ipam.contains_subnet("s1"));
    }

    #[test]
    fn test_rejects_malformed_cidr() {
        let ipam = Ipam::default();
        assert!(ipam.add_or_update_subnet("s1", "10.16.0.0", &[]).is_err());
        assert!(!ipam.contains_subnet("s1"));
    }
}
