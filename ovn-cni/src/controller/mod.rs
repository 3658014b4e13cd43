pub mod ip;
pub mod subnet;

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::runtime::reflector::Store;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use ovn_cni_crds::v1alpha1::{IP, Subnet, Vlan};
use ovn_cni_k8s_utils::create_store;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::config::ControllerArgs;
use crate::ipam::Ipam;
use crate::ovn::{OvnNb, OvnNbClient};
use crate::queue::WorkQueue;

pub struct Controller {
    pub(crate) config: ControllerArgs,
    pub(crate) client: Client,
    pub(crate) subnets: Api<Subnet>,
    pub(crate) ips: Api<IP>,
    pub(crate) node_store: Store<Node>,
    pub(crate) ns_store: Store<Namespace>,
    pub(crate) vlan_store: Store<Vlan>,
    pub(crate) ovn: Arc<dyn OvnNb>,
    pub(crate) ipam: Ipam,
    leader: Arc<AtomicBool>,

    pub(crate) add_or_update_subnet_queue: Arc<WorkQueue>,
    pub(crate) delete_subnet_queue: Arc<WorkQueue>,
    pub(crate) update_subnet_status_queue: Arc<WorkQueue>,
    pub(crate) delete_route_queue: Arc<WorkQueue>,

    // consumed by the namespace and vlan controllers; the subnet
    // reconciler only enqueues onto them
    pub(crate) add_namespace_queue: Arc<WorkQueue>,
    pub(crate) update_vlan_queue: Arc<WorkQueue>,
}

impl Controller {
    /// Only the leader replica enqueues reconciliation work; followers keep
    /// their caches warm and serve nothing.
    pub(crate) fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Relaxed)
    }
}

pub async fn start(
    args: ControllerArgs,
    leader: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> Result<()> {
    let client = Client::try_default().await?;
    let ovn: Arc<dyn OvnNb> = Arc::new(OvnNbClient::new(
        &args.ovn_nb_address,
        args.ovn_timeout,
        &args.cluster_router,
    ));

    info!("starting informer stores");
    let node_store = create_store(Api::<Node>::all(client.clone()), cancel.child_token()).await?;
    let ns_store = create_store(Api::<Namespace>::all(client.clone()), cancel.child_token()).await?;
    let vlan_store = create_store(Api::<Vlan>::all(client.clone()), cancel.child_token()).await?;

    let controller = Arc::new(Controller {
        subnets: Api::<Subnet>::all(client.clone()),
        ips: Api::<IP>::all(client.clone()),
        client,
        node_store,
        ns_store,
        vlan_store,
        ovn,
        ipam: Ipam::default(),
        leader,
        add_or_update_subnet_queue: WorkQueue::new("addOrUpdateSubnet"),
        delete_subnet_queue: WorkQueue::new("deleteSubnet"),
        update_subnet_status_queue: WorkQueue::new("updateSubnetStatus"),
        delete_route_queue: WorkQueue::new("deleteRoute"),
        add_namespace_queue: WorkQueue::new("addNamespace"),
        update_vlan_queue: WorkQueue::new("updateVlan"),
        config: args,
    });

    tokio::spawn(watch_subnets(controller.clone(), cancel.child_token()));
    tokio::spawn(watch_ips(controller.clone(), cancel.child_token()));

    info!("starting subnet workers");
    let mut workers = JoinSet::new();
    workers.spawn(run_add_subnet_worker(controller.clone()));
    workers.spawn(run_delete_subnet_worker(controller.clone()));
    workers.spawn(run_update_subnet_status_worker(controller.clone()));
    workers.spawn(run_delete_route_worker(controller.clone()));

    cancel.cancelled().await;
    info!("shutting down subnet workers");
    controller.add_or_update_subnet_queue.shut_down();
    controller.delete_subnet_queue.shut_down();
    controller.update_subnet_status_queue.shut_down();
    controller.delete_route_queue.shut_down();
    while workers.join_next().await.is_some() {}
    Ok(())
}

async fn watch_subnets(controller: Arc<Controller>, cancel: CancellationToken) {
    let api = Api::<Subnet>::all(controller.client.clone());
    let mut stream = pin!(watcher(api, watcher::Config::default()).default_backoff());
    let mut known: HashMap<String, Subnet> = HashMap::new();
    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.next() => ev,
        };
        match ev {
            Some(Ok(watcher::Event::Apply(subnet) | watcher::Event::InitApply(subnet))) => {
                let name = subnet.name_any();
                match known.insert(name, subnet.clone()) {
                    None => controller.enqueue_add_subnet(&subnet),
                    Some(old) => controller.enqueue_update_subnet(&old, &subnet),
                }
            }
            Some(Ok(watcher::Event::Delete(subnet))) => {
                known.remove(&subnet.name_any());
                controller.enqueue_delete_subnet(&subnet);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => warn!(%e, "subnet watch error"),
            None => break,
        }
    }
}

async fn watch_ips(controller: Arc<Controller>, cancel: CancellationToken) {
    let api = Api::<IP>::all(controller.client.clone());
    let mut stream = pin!(watcher(api, watcher::Config::default()).default_backoff());
    let mut known: HashMap<String, IP> = HashMap::new();
    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.next() => ev,
        };
        match ev {
            Some(Ok(watcher::Event::Apply(ip) | watcher::Event::InitApply(ip))) => {
                let name = ip.name_any();
                match known.insert(name, ip.clone()) {
                    None => controller.enqueue_add_or_del_ip(&ip),
                    Some(_) => controller.enqueue_update_ip(&ip),
                }
            }
            Some(Ok(watcher::Event::Delete(ip))) => {
                known.remove(&ip.name_any());
                controller.enqueue_add_or_del_ip(&ip);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => warn!(%e, "ip watch error"),
            None => break,
        }
    }
}

async fn run_add_subnet_worker(controller: Arc<Controller>) {
    while let Some(key) = controller.add_or_update_subnet_queue.get().await {
        if let Err(e) = controller.handle_add_or_update_subnet(&key).await {
            error!(%e, "error syncing subnet {}, requeuing", key);
            controller.add_or_update_subnet_queue.add_rate_limited(&key);
        } else {
            controller.add_or_update_subnet_queue.forget(&key);
        }
        controller.add_or_update_subnet_queue.done(&key);
    }
}

async fn run_delete_subnet_worker(controller: Arc<Controller>) {
    while let Some(key) = controller.delete_subnet_queue.get().await {
        if let Err(e) = controller.handle_delete_subnet(&key).await {
            error!(%e, "error deleting subnet {}, requeuing", key);
            controller.delete_subnet_queue.add_rate_limited(&key);
        } else {
            controller.delete_subnet_queue.forget(&key);
        }
        controller.delete_subnet_queue.done(&key);
    }
}

async fn run_update_subnet_status_worker(controller: Arc<Controller>) {
    while let Some(key) = controller.update_subnet_status_queue.get().await {
        if let Err(e) = controller.handle_update_subnet_status(&key).await {
            error!(%e, "error refreshing subnet {} status, requeuing", key);
            controller.update_subnet_status_queue.add_rate_limited(&key);
        } else {
            controller.update_subnet_status_queue.forget(&key);
        }
        controller.update_subnet_status_queue.done(&key);
    }
}

async fn run_delete_route_worker(controller: Arc<Controller>) {
    while let Some(key) = controller.delete_route_queue.get().await {
        if let Err(e) = controller.handle_delete_route(&key).await {
            error!(%e, "error deleting route {}, requeuing", key);
            controller.delete_route_queue.add_rate_limited(&key);
        } else {
            controller.delete_route_queue.forget(&key);
        }
        controller.delete_route_queue.done(&key);
    }
}
