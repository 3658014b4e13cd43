use ovn_cni_crds::v1alpha1::IP;
use tracing::debug;

use super::Controller;

/// Subnets whose status counters an IP event touches: the primary subnet
/// plus every attached one.
pub(crate) fn fan_out_subnets(ip: &IP) -> Vec<&str> {
    let mut subnets = vec![ip.spec.subnet.as_str()];
    subnets.extend(ip.spec.attach_subnets.iter().map(String::as_str));
    subnets
}

impl Controller {
    pub(crate) fn enqueue_add_or_del_ip(&self, ip: &IP) {
        if !self.is_leader() {
            return;
        }
        for subnet in fan_out_subnets(ip) {
            debug!("enqueue update status subnet {}", subnet);
            self.update_subnet_status_queue.add(subnet);
        }
    }

    /// The primary subnet of an existing IP is stable; updates only touch
    /// attachments.
    pub(crate) fn enqueue_update_ip(&self, ip: &IP) {
        if !self.is_leader() {
            return;
        }
        for subnet in &ip.spec.attach_subnets {
            debug!("enqueue update status subnet {}", subnet);
            self.update_subnet_status_queue.add(subnet);
        }
    }
}

#[cfg(test)]
mod test {
    use ovn_cni_crds::v1alpha1::IPSpec;

    use super::*;

    #[test]
    fn test_fan_out_covers_primary_and_attachments() {
        let ip = IP::new(
            "p.ns",
            IPSpec {
                subnet: "s1".into(),
                attach_subnets: vec!["s2".into(), "s3".into()],
                ..Default::default()
            },
        );
        assert_eq!(fan_out_subnets(&ip), vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn test_fan_out_without_attachments() {
        let ip = IP::new(
            "p.ns",
            IPSpec {
                subnet: "s1".into(),
                ..Default::default()
            },
        );
        assert_eq!(fan_out_subnets(&ip), vec!["s1"]);
    }
}
