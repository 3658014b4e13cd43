use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::ObjectRef;
use ovn_cni_crds::v1alpha1::{GatewayType, IP, Subnet, SubnetStatus};
use tracing::{debug, error, info, warn};

use super::Controller;
use crate::ovn::RoutePolicy;
use crate::util::{
    self, CONTROLLER_FINALIZER, LOGICAL_SWITCH_ANNOTATION, NETWORK_TYPE_VLAN, OVN_PROVIDER,
    SUBNET_NAME_LABEL, TUNNEL_IP_ANNOTATION,
};
use crate::{Error, Result, is_not_found};

impl Controller {
    pub(crate) fn enqueue_add_subnet(&self, subnet: &Subnet) {
        if !self.is_leader() {
            return;
        }
        let key = subnet.name_any();
        debug!("enqueue add subnet {}", key);
        self.add_or_update_subnet_queue.add(&key);
    }

    pub(crate) fn enqueue_update_subnet(&self, old: &Subnet, new: &Subnet) {
        if !self.is_leader() {
            return;
        }
        let key = new.name_any();

        // a deleted subnet with no users is ready for finalizer removal
        if new.metadata.deletion_timestamp.is_some()
            && new.status.as_ref().map(|s| s.using_ips).unwrap_or_default() == 0.0
        {
            self.add_or_update_subnet_queue.add(&key);
            return;
        }

        if subnet_update_triggers_sync(old, new) {
            debug!("enqueue update subnet {}", key);
            self.add_or_update_subnet_queue.add(&key);
        }
    }

    pub(crate) fn enqueue_delete_subnet(&self, subnet: &Subnet) {
        if !self.is_leader() {
            return;
        }
        let key = subnet.name_any();
        debug!("enqueue delete subnet {}", key);
        self.delete_subnet_queue.add(&key);
        if subnet.spec.gateway_type == Some(GatewayType::Centralized) {
            self.delete_route_queue.add(&subnet.spec.cidr_block);
        }
    }

    pub(crate) async fn handle_add_or_update_subnet(&self, key: &str) -> Result<()> {
        let mut subnet = match self.subnets.get(key).await {
            Ok(subnet) => subnet,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if self.handle_subnet_finalizer(&mut subnet).await? {
            return Ok(());
        }

        self.format_subnet(&mut subnet).await?;

        if let Err(e) = self.calc_subnet_status_ip(&mut subnet).await {
            error!(%e, "calculate subnet {} used ip failed", key);
            return Err(e);
        }

        self.ipam
            .add_or_update_subnet(key, &subnet.spec.cidr_block, &subnet.spec.exclude_ips)?;

        if !is_ovn_subnet(&subnet) {
            return Ok(());
        }

        match util::validate_subnet(&subnet) {
            Err(e) => {
                error!(%e, "failed to validate subnet {}", key);
                self.patch_subnet_status(&mut subnet, "ValidateLogicalSwitchFailed", &e.to_string())
                    .await;
                return Err(e);
            }
            Ok(()) => {
                self.patch_subnet_status(&mut subnet, "ValidateLogicalSwitchSuccess", "")
                    .await;
            }
        }

        let subnet_list = self.subnets.list(&ListParams::default()).await.map_err(|e| {
            error!(%e, "failed to list subnets");
            Error::from(e)
        })?;
        for other in &subnet_list.items {
            if other.name_any() != key
                && util::cidr_conflict(&other.spec.cidr_block, &subnet.spec.cidr_block)
            {
                let msg = format!(
                    "subnet {} cidr {} conflict with subnet {} cidr {}",
                    key,
                    subnet.spec.cidr_block,
                    other.name_any(),
                    other.spec.cidr_block
                );
                error!("{}", msg);
                self.patch_subnet_status(&mut subnet, "ValidateLogicalSwitchFailed", &msg)
                    .await;
                return Err(Error::Validation(msg));
            }
        }

        for node in self.node_store.state() {
            for addr in node_internal_ips(&node) {
                if util::cidr_contains_ip(&subnet.spec.cidr_block, &addr) {
                    let msg = format!(
                        "subnet {} cidr {} conflict with node {} address {}",
                        key,
                        subnet.spec.cidr_block,
                        node.name_any(),
                        addr
                    );
                    error!("{}", msg);
                    self.patch_subnet_status(&mut subnet, "ValidateLogicalSwitchFailed", &msg)
                        .await;
                    return Err(Error::Validation(msg));
                }
            }
        }

        let protocol = subnet
            .spec
            .protocol
            .ok_or_else(|| Error::Validation(format!("subnet {key} has no protocol")))?;

        let exists = match self.ovn.logical_switch_exists(key).await {
            Err(e) => {
                error!(%e, "failed to list logical switch");
                self.patch_subnet_status(&mut subnet, "ListLogicalSwitchFailed", &e.to_string())
                    .await;
                return Err(e);
            }
            Ok(exists) => exists,
        };

        if !exists {
            status_mut(&mut subnet).ensure_standard_conditions();
            // if multiple subnets race for the same switch name, only the
            // first create lands
            if let Err(e) = self
                .ovn
                .create_logical_switch(
                    key,
                    protocol,
                    &subnet.spec.cidr_block,
                    &subnet.spec.gateway,
                    &subnet.spec.exclude_ips,
                    subnet.spec.underlay_gateway,
                )
                .await
            {
                self.patch_subnet_status(&mut subnet, "CreateLogicalSwitchFailed", &e.to_string())
                    .await;
                return Err(e);
            }
        } else if let Err(e) = self
            .ovn
            .set_logical_switch_config(
                key,
                protocol,
                &subnet.spec.cidr_block,
                &subnet.spec.gateway,
                &subnet.spec.exclude_ips,
            )
            .await
        {
            self.patch_subnet_status(&mut subnet, "SetLogicalSwitchConfigFailed", &e.to_string())
                .await;
            return Err(e);
        }

        if let Err(e) = self.reconcile_subnet(&mut subnet).await {
            error!(%e, "reconcile subnet {} failed", key);
            return Err(e);
        }

        if subnet.spec.private {
            match self
                .ovn
                .set_private_logical_switch(
                    key,
                    protocol,
                    &subnet.spec.cidr_block,
                    &subnet.spec.allow_subnets,
                )
                .await
            {
                Err(e) => {
                    self.patch_subnet_status(
                        &mut subnet,
                        "SetPrivateLogicalSwitchFailed",
                        &e.to_string(),
                    )
                    .await;
                    return Err(e);
                }
                Ok(()) => {
                    self.patch_subnet_status(&mut subnet, "SetPrivateLogicalSwitchSuccess", "")
                        .await;
                }
            }
        } else {
            match self.ovn.reset_logical_switch_acl(key, protocol).await {
                Err(e) => {
                    self.patch_subnet_status(
                        &mut subnet,
                        "ResetLogicalSwitchAclFailed",
                        &e.to_string(),
                    )
                    .await;
                    return Err(e);
                }
                Ok(()) => {
                    self.patch_subnet_status(&mut subnet, "ResetLogicalSwitchAclSuccess", "")
                        .await;
                }
            }
        }

        Ok(())
    }

    /// Returns true when processing should stop: either the finalizer was
    /// just added (the update re-runs the handler) or the subnet was
    /// released for deletion.
    async fn handle_subnet_finalizer(&self, subnet: &mut Subnet) -> Result<bool> {
        let name = subnet.name_any();
        let has_finalizer = subnet.finalizers().iter().any(|f| f == CONTROLLER_FINALIZER);

        if subnet.metadata.deletion_timestamp.is_none() && !has_finalizer {
            subnet
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(CONTROLLER_FINALIZER.to_string());
            *subnet = self
                .subnets
                .replace(&name, &PostParams::default(), subnet)
                .await
                .map_err(|e| {
                    error!(%e, "failed to add finalizer to subnet {}", name);
                    Error::from(e)
                })?;
            // the finalizer update itself is filtered out by the intake
            // rules, so re-enter explicitly
            self.add_or_update_subnet_queue.add(&name);
            return Ok(true);
        }

        if subnet.metadata.deletion_timestamp.is_some()
            && subnet.status.as_ref().map(|s| s.using_ips).unwrap_or_default() == 0.0
        {
            if let Some(finalizers) = subnet.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != CONTROLLER_FINALIZER);
            }
            *subnet = self
                .subnets
                .replace(&name, &PostParams::default(), subnet)
                .await
                .map_err(|e| {
                    error!(%e, "failed to remove finalizer from subnet {}", name);
                    Error::from(e)
                })?;
            info!("released subnet {} for deletion", name);
            return Ok(true);
        }
        Ok(false)
    }

    /// Normalize the spec; any change is persisted before reconciliation
    /// continues.
    async fn format_subnet(&self, subnet: &mut Subnet) -> Result<()> {
        let ctx = FormatContext {
            default_logical_switch: &self.config.default_logical_switch,
            network_type: &self.config.network_type,
            default_vlan: &self.config.default_vlan_name,
            vlan_names: self
                .vlan_store
                .state()
                .iter()
                .map(|v| v.name_any())
                .collect(),
        };
        if apply_subnet_defaults(subnet, &ctx)? {
            let name = subnet.name_any();
            *subnet = self
                .subnets
                .replace(&name, &PostParams::default(), subnet)
                .await
                .map_err(|e| {
                    error!(%e, "failed to update subnet {}", name);
                    Error::from(e)
                })?;
        }
        Ok(())
    }

    async fn calc_subnet_status_ip(&self, subnet: &mut Subnet) -> Result<()> {
        let name = subnet.name_any();
        util::parse_cidrs(&subnet.spec.cidr_block)?;

        // every IP object carries an empty-valued label per subnet it
        // belongs to
        let used = self
            .ips
            .list(&ListParams::default().labels(&format!("{name}=")))
            .await?;
        let (available, using) =
            subnet_ip_counters(&subnet.spec.cidr_block, &subnet.spec.exclude_ips, &used.items)?;

        let status = status_mut(subnet);
        status.available_ips = available;
        status.using_ips = using;
        let patch = status.merge_patch()?;
        *subnet = self
            .subnets
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Best-effort condition + counter patch; failures are logged, never
    /// returned.
    async fn patch_subnet_status(&self, subnet: &mut Subnet, reason: &str, err_msg: &str) {
        let name = subnet.name_any();
        let status = status_mut(subnet);
        if !err_msg.is_empty() {
            status.set_error(reason, err_msg);
            status.not_validated(reason, err_msg);
            status.not_ready(reason, err_msg);
        } else {
            status.validated(reason, "");
            if reason == "SetPrivateLogicalSwitchSuccess"
                || reason == "ResetLogicalSwitchAclSuccess"
            {
                status.ready(reason, "");
            }
        }

        match status.merge_patch() {
            Err(e) => error!(%e, "failed to serialize status of subnet {}", name),
            Ok(patch) => {
                if let Err(e) = self
                    .subnets
                    .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    error!(%e, "patch subnet {} status failed", name);
                }
            }
        }
    }

    pub(crate) async fn handle_update_subnet_status(&self, key: &str) -> Result<()> {
        let mut subnet = match self.subnets.get(key).await {
            Ok(subnet) => subnet,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.calc_subnet_status_ip(&mut subnet).await
    }

    pub(crate) async fn handle_delete_route(&self, key: &str) -> Result<()> {
        if util::parse_cidrs(key).is_err() {
            return Ok(());
        }
        for cidr in key.split(',') {
            self.ovn
                .delete_static_route(cidr.trim(), &self.config.cluster_router)
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_delete_subnet(&self, key: &str) -> Result<()> {
        self.ipam.delete_subnet(key);

        let exists = self.ovn.logical_switch_exists(key).await.map_err(|e| {
            error!(%e, "failed to list logical switch");
            e
        })?;
        if exists {
            self.ovn.clean_logical_switch_acl(key).await.map_err(|e| {
                error!(%e, "failed to delete acl of logical switch {}", key);
                e
            })?;
            self.ovn.delete_logical_switch(key).await.map_err(|e| {
                error!(%e, "failed to delete logical switch {}", key);
                e
            })?;
        }

        // namespaces still pointing at this switch get rebound by their
        // own controller
        for ns in self.ns_store.state() {
            if ns.annotations().get(LOGICAL_SWITCH_ANNOTATION).map(String::as_str) == Some(key) {
                self.add_namespace_queue.add(&ns.name_any());
            }
        }

        if self.config.network_type == NETWORK_TYPE_VLAN {
            self.ovn.delete_localnet_port(key).await?;
            for vlan in self.vlan_store.state() {
                if vlan.spec.subnet.split(',').any(|s| s.trim() == key) {
                    self.update_vlan_queue.add(&vlan.name_any());
                }
            }
        }

        Ok(())
    }

    async fn reconcile_subnet(&self, subnet: &mut Subnet) -> Result<()> {
        self.reconcile_namespaces(subnet).await.map_err(|e| {
            error!(%e, "reconcile namespaces for subnet {} failed", subnet.name_any());
            e
        })?;

        if subnet.name_any() != self.config.node_switch {
            self.reconcile_gateway(subnet).await.map_err(|e| {
                error!(%e, "reconcile gateway for subnet {} failed", subnet.name_any());
                e
            })?;
        }

        self.reconcile_vlan(subnet).await.map_err(|e| {
            error!(%e, "reconcile vlan for subnet {} failed", subnet.name_any());
            e
        })?;
        Ok(())
    }

    async fn reconcile_namespaces(&self, subnet: &Subnet) -> Result<()> {
        let name = subnet.name_any();
        let desired: HashSet<&str> = subnet.spec.namespaces.iter().map(String::as_str).collect();

        // a namespace binds to exactly one subnet; strip it everywhere else
        let subnet_list = self.subnets.list(&ListParams::default()).await?;
        for mut other in subnet_list.items {
            if other.name_any() == name || other.spec.namespaces.is_empty() {
                continue;
            }
            let reserved: Vec<String> = other
                .spec
                .namespaces
                .iter()
                .filter(|ns| !desired.contains(ns.as_str()))
                .cloned()
                .collect();
            if reserved.len() != other.spec.namespaces.len() {
                let other_name = other.name_any();
                other.spec.namespaces = reserved;
                self.subnets
                    .replace(&other_name, &PostParams::default(), &other)
                    .await
                    .map_err(|e| {
                        error!(%e, "failed to unbind namespace from subnet {}", other_name);
                        Error::from(e)
                    })?;
            }
        }

        for ns in &subnet.spec.namespaces {
            self.add_namespace_queue.add(ns);
        }

        // orphans annotated for this switch but no longer bound
        for ns in self.ns_store.state() {
            if ns.annotations().get(LOGICAL_SWITCH_ANNOTATION).map(String::as_str)
                == Some(name.as_str())
                && !desired.contains(ns.name_any().as_str())
            {
                self.add_namespace_queue.add(&ns.name_any());
            }
        }

        Ok(())
    }

    async fn reconcile_gateway(&self, subnet: &mut Subnet) -> Result<()> {
        let name = subnet.name_any();
        let ips = self
            .ips
            .list(&ListParams::default().labels(&format!("{SUBNET_NAME_LABEL}={name}")))
            .await
            .map_err(|e| {
                error!(%e, "failed to list ip of subnet {}", name);
                Error::from(e)
            })?;

        if subnet.spec.gateway_type != Some(GatewayType::Centralized) {
            // distributed: tear down the aggregate route and steer each
            // address through its own node
            if status_mut(subnet).activate_gateway.is_empty() {
                return Ok(());
            }
            let status = status_mut(subnet);
            status.activate_gateway = String::new();
            let patch = status.merge_patch()?;
            self.subnets
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;

            for ip in &ips.items {
                let Some(node) = self.node_store.get(&ObjectRef::new(&ip.spec.node_name)) else {
                    continue;
                };
                let next_hop = node_tunnel_ip(&node)?;
                for addr in ip.spec.ip_address.split(',') {
                    self.ovn
                        .add_static_route(
                            RoutePolicy::SrcIp,
                            addr.trim(),
                            &next_hop.to_string(),
                            &self.config.cluster_router,
                        )
                        .await?;
                }
            }
            for cidr in subnet.spec.cidr_block.split(',') {
                self.ovn
                    .delete_static_route(cidr.trim(), &self.config.cluster_router)
                    .await
                    .map_err(|e| {
                        error!(%e, "failed to delete static route {}", cidr);
                        e
                    })?;
            }
            return Ok(());
        }

        info!("start to init centralized gateway for subnet {}", name);

        // keep the current gateway while its node stays ready
        let current = subnet
            .status
            .as_ref()
            .map(|s| s.activate_gateway.clone())
            .unwrap_or_default();
        if !current.is_empty()
            && let Some(node) = self.node_store.get(&ObjectRef::new(&current))
            && node_ready(&node)
        {
            info!("subnet {} keeps activate gateway {}", name, current);
            return Ok(());
        }

        let picked = pick_gateway_node(&subnet.spec.gateway_node, |gw| {
            self.node_store.get(&ObjectRef::new(gw))
        });
        let Some(node) = picked else {
            warn!("all gateways of subnet {} are not ready", name);
            let status = status_mut(subnet);
            status.activate_gateway = String::new();
            status.not_ready("NoReadyGateway", "");
            let patch = status.merge_patch()?;
            self.subnets
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            return Ok(());
        };
        let node_name = node.name_any();
        info!("subnet {} uses a new activate gateway {}", name, node_name);

        let next_hop = node_tunnel_ip(&node)?;
        for cidr in subnet.spec.cidr_block.split(',') {
            self.ovn
                .add_static_route(
                    RoutePolicy::SrcIp,
                    cidr.trim(),
                    &next_hop.to_string(),
                    &self.config.cluster_router,
                )
                .await?;
        }
        for ip in &ips.items {
            for addr in ip.spec.ip_address.split(',') {
                self.ovn
                    .delete_static_route(addr.trim(), &self.config.cluster_router)
                    .await
                    .map_err(|e| {
                        error!(%e, "failed to delete static route {}", addr);
                        e
                    })?;
            }
        }

        let status = status_mut(subnet);
        status.activate_gateway = node_name;
        status.ready("ReconcileCentralizedGatewaySuccess", "");
        let patch = status.merge_patch()?;
        self.subnets
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn reconcile_vlan(&self, subnet: &Subnet) -> Result<()> {
        if self.config.network_type != NETWORK_TYPE_VLAN {
            return Ok(());
        }
        let name = subnet.name_any();
        debug!("reconcile vlan {} of subnet {}", subnet.spec.vlan, name);

        if !subnet.spec.vlan.is_empty() {
            let Some(vlan) = self.vlan_store.get(&ObjectRef::new(&subnet.spec.vlan)) else {
                return Err(Error::Validation(format!(
                    "vlan {} of subnet {} not found",
                    subnet.spec.vlan, name
                )));
            };
            let network_name = if vlan.spec.provider_interface_name.is_empty() {
                "provider".to_string()
            } else {
                vlan.spec.provider_interface_name.clone()
            };
            self.ovn
                .create_localnet_port(&name, &network_name, &vlan.spec.vlan_id.to_string())
                .await
                .map_err(|e| {
                    error!(%e, "failed to add localnet to subnet {}", name);
                    e
                })?;
            self.update_vlan_queue.add(&subnet.spec.vlan);
        }

        for vlan in self.vlan_store.state() {
            if vlan.spec.subnet.split(',').any(|s| s.trim() == name) {
                self.update_vlan_queue.add(&vlan.name_any());
            }
        }

        Ok(())
    }
}

pub(crate) struct FormatContext<'a> {
    pub default_logical_switch: &'a str,
    pub network_type: &'a str,
    pub default_vlan: &'a str,
    pub vlan_names: HashSet<String>,
}

/// Spec normalization of §formatSubnet; returns whether anything changed.
/// Applying it twice equals applying it once.
pub(crate) fn apply_subnet_defaults(subnet: &mut Subnet, ctx: &FormatContext) -> Result<bool> {
    let name = subnet.name_any();
    let spec = &mut subnet.spec;
    let mut changed = false;

    let canonical = util::canonical_cidr(&spec.cidr_block)?;
    if canonical != spec.cidr_block {
        spec.cidr_block = canonical;
        changed = true;
    }

    if spec.provider.is_empty() {
        spec.provider = OVN_PROVIDER.to_string();
        changed = true;
    }

    let protocol = util::check_protocol(&spec.cidr_block)?;
    if spec.protocol != Some(protocol) {
        spec.protocol = Some(protocol);
        changed = true;
    }

    if spec.gateway_type.is_none() {
        spec.gateway_type = Some(GatewayType::Distributed);
        changed = true;
    }

    if spec.default && name != ctx.default_logical_switch {
        spec.default = false;
        changed = true;
    }

    if spec.gateway.is_empty() {
        spec.gateway = util::first_subnet_ip(&spec.cidr_block)?;
        changed = true;
    }

    if spec.exclude_ips.is_empty() {
        spec.exclude_ips = spec.gateway.split(',').map(str::to_string).collect();
        changed = true;
    } else {
        let expanded: HashSet<String> = util::expand_exclude_ips(&spec.exclude_ips)
            .into_iter()
            .collect();
        let gateway = spec.gateway.clone();
        for gw in gateway.split(',') {
            if !expanded.contains(gw) {
                spec.exclude_ips.push(gw.to_string());
                changed = true;
            }
        }
    }

    if ctx.network_type == NETWORK_TYPE_VLAN && spec.vlan.is_empty() {
        spec.vlan = ctx.default_vlan.to_string();
        changed = true;
    }

    if !spec.vlan.is_empty() && !ctx.vlan_names.contains(&spec.vlan) {
        spec.vlan = String::new();
        changed = true;
    }

    Ok(changed)
}

/// Only these spec changes re-enqueue an update (§event intake).
pub(crate) fn subnet_update_triggers_sync(old: &Subnet, new: &Subnet) -> bool {
    old.spec.private != new.spec.private
        || old.spec.allow_subnets != new.spec.allow_subnets
        || old.spec.namespaces != new.spec.namespaces
        || old.spec.gateway_type != new.spec.gateway_type
        || old.spec.gateway_node != new.spec.gateway_node
        || old.spec.exclude_ips != new.spec.exclude_ips
        || old.spec.vlan != new.spec.vlan
}

pub(crate) fn is_ovn_subnet(subnet: &Subnet) -> bool {
    subnet.spec.provider.is_empty() || subnet.spec.provider == OVN_PROVIDER
}

pub(crate) fn status_mut(subnet: &mut Subnet) -> &mut SubnetStatus {
    subnet.status.get_or_insert_with(SubnetStatus::default)
}

/// The leftmost ready node in the comma-separated gateway list wins.
pub(crate) fn pick_gateway_node(
    gateway_node: &str,
    lookup: impl Fn(&str) -> Option<Arc<Node>>,
) -> Option<Arc<Node>> {
    for gw in gateway_node.split(',') {
        let gw = gw.trim();
        if gw.is_empty() {
            continue;
        }
        if let Some(node) = lookup(gw)
            && node_ready(&node)
        {
            return Some(node);
        }
    }
    None
}

pub(crate) fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub(crate) fn node_tunnel_ip(node: &Node) -> Result<IpAddr> {
    let name = node.name_any();
    let raw = node
        .annotations()
        .get(TUNNEL_IP_ANNOTATION)
        .ok_or_else(|| Error::Validation(format!("node {name} has no tunnel endpoint ip")))?;
    IpAddr::from_str(raw).map_err(|e| {
        Error::Validation(format!("node {name} tunnel endpoint ip {raw} is invalid: {e}"))
    })
}

pub(crate) fn node_internal_ips(node: &Node) -> Vec<String> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|addresses| {
            addresses
                .iter()
                .filter(|a| a.type_ == "InternalIP")
                .map(|a| a.address.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// availableIPs / usingIPs for the status counters: everything excluded or
/// in use is subtracted once from the block's address count.
pub(crate) fn subnet_ip_counters(
    cidr_block: &str,
    exclude_ips: &[String],
    used: &[IP],
) -> Result<(f64, f64)> {
    let mut to_sub: HashSet<String> = util::expand_exclude_ips(exclude_ips).into_iter().collect();
    for ip in used {
        to_sub.insert(ip.spec.ip_address.clone());
    }
    let available = util::address_count(cidr_block)? - to_sub.len() as f64;
    Ok((available, used.len() as f64))
}

#[cfg(test)]
mod test {
    use std::collections::{BTreeMap, HashMap};

    use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeStatus};
    use kube::api::ObjectMeta;
    use ovn_cni_crds::v1alpha1::{IPSpec, Protocol, SubnetSpec};

    use super::*;

    fn test_subnet(name: &str, spec: SubnetSpec) -> Subnet {
        Subnet::new(name, spec)
    }

    fn test_node(name: &str, ready: bool, tunl_ip: Option<&str>) -> Node {
        let mut annotations = BTreeMap::new();
        if let Some(ip) = tunl_ip {
            annotations.insert(TUNNEL_IP_ANNOTATION.to_string(), ip.to_string());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: if ready { "True".into() } else { "False".into() },
                    ..Default::default()
                }]),
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".into(),
                    address: "192.168.0.10".into(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn format_ctx<'a>(vlans: &[&str]) -> FormatContext<'a> {
        FormatContext {
            default_logical_switch: "ovn-default",
            network_type: "geneve",
            default_vlan: "ovn-vlan",
            vlan_names: vlans.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn test_apply_subnet_defaults_fills_empty_spec() {
        let mut subnet = test_subnet(
            "s1",
            SubnetSpec {
                cidr_block: "10.16.0.0/16".into(),
                ..Default::default()
            },
        );
        let changed = apply_subnet_defaults(&mut subnet, &format_ctx(&[])).expect("valid subnet");
        assert!(changed);
        assert_eq!(subnet.spec.gateway, "10.16.0.1");
        assert_eq!(subnet.spec.exclude_ips, vec!["10.16.0.1"]);
        assert_eq!(subnet.spec.protocol, Some(Protocol::IPv4));
        assert_eq!(subnet.spec.provider, "ovn");
        assert_eq!(subnet.spec.gateway_type, Some(GatewayType::Distributed));
    }

    #[test]
    fn test_apply_subnet_defaults_is_idempotent() {
        let mut subnet = test_subnet(
            "s1",
            SubnetSpec {
                cidr_block: "10.16.0.1/16".into(),
                exclude_ips: vec!["10.16.0.10..10.16.0.20".into()],
                ..Default::default()
            },
        );
        assert!(apply_subnet_defaults(&mut subnet, &format_ctx(&[])).expect("valid subnet"));
        let first = subnet.spec.clone();
        assert_eq!(first.cidr_block, "10.16.0.0/16");
        // gateway appended to exclude ips because the range misses it
        assert!(first.exclude_ips.contains(&"10.16.0.1".to_string()));

        let changed = apply_subnet_defaults(&mut subnet, &format_ctx(&[])).expect("valid subnet");
        assert!(!changed);
        assert_eq!(subnet.spec, first);
    }

    #[test]
    fn test_apply_subnet_defaults_dual_stack() {
        let mut subnet = test_subnet(
            "s1",
            SubnetSpec {
                cidr_block: "10.16.0.0/16,fd00::/64".into(),
                ..Default::default()
            },
        );
        apply_subnet_defaults(&mut subnet, &format_ctx(&[])).expect("valid subnet");
        assert_eq!(subnet.spec.protocol, Some(Protocol::Dual));
        assert_eq!(subnet.spec.gateway, "10.16.0.1,fd00::1");
        assert_eq!(subnet.spec.exclude_ips, vec!["10.16.0.1", "fd00::1"]);
    }

    #[test]
    fn test_apply_subnet_defaults_clears_foreign_default_flag() {
        let mut subnet = test_subnet(
            "s1",
            SubnetSpec {
                cidr_block: "10.16.0.0/16".into(),
                default: true,
                ..Default::default()
            },
        );
        apply_subnet_defaults(&mut subnet, &format_ctx(&[])).expect("valid subnet");
        assert!(!subnet.spec.default);

        let mut subnet = test_subnet(
            "ovn-default",
            SubnetSpec {
                cidr_block: "10.16.0.0/16".into(),
                default: true,
                ..Default::default()
            },
        );
        apply_subnet_defaults(&mut subnet, &format_ctx(&[])).expect("valid subnet");
        assert!(subnet.spec.default);
    }

    #[test]
    fn test_apply_subnet_defaults_vlan_handling() {
        let ctx = FormatContext {
            default_logical_switch: "ovn-default",
            network_type: "vlan",
            default_vlan: "ovn-vlan",
            vlan_names: ["ovn-vlan".to_string()].into_iter().collect(),
        };
        let mut subnet = test_subnet(
            "s1",
            SubnetSpec {
                cidr_block: "10.16.0.0/16".into(),
                ..Default::default()
            },
        );
        apply_subnet_defaults(&mut subnet, &ctx).expect("valid subnet");
        assert_eq!(subnet.spec.vlan, "ovn-vlan");

        // dangling vlan references self-heal to empty
        subnet.spec.vlan = "missing".into();
        apply_subnet_defaults(&mut subnet, &format_ctx(&[])).expect("valid subnet");
        assert_eq!(subnet.spec.vlan, "");
    }

    #[test]
    fn test_subnet_update_triggers_sync() {
        let old = test_subnet(
            "s1",
            SubnetSpec {
                cidr_block: "10.16.0.0/16".into(),
                ..Default::default()
            },
        );
        let mut new = old.clone();
        assert!(!subnet_update_triggers_sync(&old, &new));

        new.spec.namespaces = vec!["ns1".into()];
        assert!(subnet_update_triggers_sync(&old, &new));

        // cidr alone is not a sync trigger
        let mut new = old.clone();
        new.spec.cidr_block = "10.17.0.0/16".into();
        assert!(!subnet_update_triggers_sync(&old, &new));
    }

    #[test]
    fn test_pick_gateway_node_leftmost_ready_wins() {
        let mut nodes = HashMap::new();
        nodes.insert("a".to_string(), Arc::new(test_node("a", false, Some("192.168.0.2"))));
        nodes.insert("b".to_string(), Arc::new(test_node("b", true, Some("192.168.0.3"))));
        nodes.insert("c".to_string(), Arc::new(test_node("c", true, Some("192.168.0.4"))));

        let picked = pick_gateway_node("a, b, c", |name| nodes.get(name).cloned())
            .expect("ready node in list");
        assert_eq!(picked.name_any(), "b");

        assert!(pick_gateway_node("a", |name| nodes.get(name).cloned()).is_none());
        assert!(pick_gateway_node("missing", |name| nodes.get(name).cloned()).is_none());
    }

    #[test]
    fn test_node_helpers() {
        let node = test_node("a", true, Some("192.168.0.2"));
        assert!(node_ready(&node));
        assert_eq!(
            node_tunnel_ip(&node).expect("annotated node"),
            IpAddr::from_str("192.168.0.2").expect("valid address")
        );
        assert_eq!(node_internal_ips(&node), vec!["192.168.0.10"]);

        let node = test_node("b", false, None);
        assert!(!node_ready(&node));
        assert!(node_tunnel_ip(&node).is_err());
    }

    #[test]
    fn test_subnet_ip_counters() {
        let used = vec![
            IP::new(
                "p1.ns",
                IPSpec {
                    ip_address: "10.16.0.5".into(),
                    ..Default::default()
                },
            ),
            IP::new(
                "p2.ns",
                IPSpec {
                    ip_address: "10.16.0.6".into(),
                    ..Default::default()
                },
            ),
        ];
        let exclude = vec!["10.16.0.1".to_string(), "10.16.0.5".to_string()];
        let (available, using) =
            subnet_ip_counters("10.16.0.0/16", &exclude, &used).expect("valid cidr");
        // 10.16.0.5 counts once even though excluded and in use
        assert_eq!(available, 65534.0 - 3.0);
        assert_eq!(using, 2.0);

        let count = util::address_count("10.16.0.0/16").expect("valid cidr");
        assert_eq!(available + 3.0, count);
    }

    #[test]
    fn test_is_ovn_subnet() {
        let mut subnet = test_subnet(
            "s1",
            SubnetSpec {
                cidr_block: "10.16.0.0/16".into(),
                ..Default::default()
            },
        );
        assert!(is_ovn_subnet(&subnet));
        subnet.spec.provider = "ovn".into();
        assert!(is_ovn_subnet(&subnet));
        subnet.spec.provider = "macvlan".into();
        assert!(!is_ovn_subnet(&subnet));
    }
}
