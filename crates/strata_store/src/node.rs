//! Node wiring and the embeddable in-process cluster.
//!
//! `NodeState` assembles the collaborators one node needs: cluster service,
//! indices, transport registry, and the registered actions. `LocalCluster`
//! wires several nodes over a `MeshTransport` for the demo binary and the
//! integration tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::master::StatePublisher;

use strata_cluster::cluster::{
    ClusterService, ClusterState, DiscoveryNode, IndexMetadata, IndexRoutingTable, IndexSettings,
    IndexShardRoutingTable, NodeId, ShardId, ShardRouting, ShardRoutingState,
};

use crate::action::consistency::WriteConsistencyLevel;
use crate::action::index::IndexAction;
use crate::action::replication::{ActionContext, ReplicatedAction};
use crate::indices::IndicesService;
use crate::master::{FanoutPublisher, MappingUpdateAction, MasterService, ShardStateAction};
use crate::transport::{MeshTransport, Transport, TransportRegistry};

/// Max wait for the master to ack a shard-failed report.
pub const SHARD_FAILURE_TIMEOUT_SETTING: &str = "action.support.replication.shard.failure_timeout";
/// Default write-consistency level when a request says `Default`.
pub const WRITE_CONSISTENCY_SETTING: &str = "action.write_consistency";

/// Per-node configuration.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub node_id: NodeId,
    pub master_node: NodeId,
    pub default_write_consistency: WriteConsistencyLevel,
    pub shard_failure_timeout: Option<Duration>,
    pub executor_capacity: usize,
}

impl NodeSettings {
    pub fn new(node_id: NodeId, master_node: NodeId) -> Self {
        Self {
            node_id,
            master_node,
            default_write_consistency: WriteConsistencyLevel::Quorum,
            shard_failure_timeout: None,
            executor_capacity: 64,
        }
    }

    /// Apply one settings key. Unknown keys are rejected.
    pub fn apply(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            WRITE_CONSISTENCY_SETTING => {
                self.default_write_consistency =
                    value.parse().map_err(|err: String| anyhow::anyhow!(err))?;
            }
            SHARD_FAILURE_TIMEOUT_SETTING => {
                self.shard_failure_timeout = Some(parse_duration(value)?);
            }
            other => anyhow::bail!("unknown setting [{other}]"),
        }
        Ok(())
    }
}

/// Parse `"500ms"`, `"30s"`, or `"5m"` into a duration.
fn parse_duration(value: &str) -> anyhow::Result<Duration> {
    let value = value.trim();
    let (number, unit) = value
        .find(|c: char| !c.is_ascii_digit())
        .map(|at| value.split_at(at))
        .ok_or_else(|| anyhow::anyhow!("missing unit in duration [{value}]"))?;
    let number: u64 = number
        .parse()
        .with_context(|| format!("invalid duration [{value}]"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number * 60)),
        other => anyhow::bail!("unknown duration unit [{other}]"),
    }
}

/// Everything one node runs.
pub struct NodeState {
    pub settings: NodeSettings,
    pub cluster: Arc<ClusterService>,
    pub indices: Arc<IndicesService>,
    pub registry: Arc<TransportRegistry>,
    pub transport: Arc<dyn Transport>,
    pub shard_state: Arc<ShardStateAction>,
    pub index_action: Arc<ReplicatedAction<IndexAction>>,
}

impl NodeState {
    pub fn build(
        settings: NodeSettings,
        initial_state: ClusterState,
        transport: Arc<dyn Transport>,
        data_path: impl Into<PathBuf>,
    ) -> anyhow::Result<Arc<Self>> {
        let cluster = ClusterService::new(settings.node_id, initial_state);
        let indices = IndicesService::open(data_path)?;
        let registry = TransportRegistry::new(settings.node_id, settings.executor_capacity);
        let shard_state =
            ShardStateAction::new(cluster.clone(), transport.clone(), settings.master_node);
        let mapping_updater =
            MappingUpdateAction::new(transport.clone(), indices.clone(), settings.master_node);
        let ctx = ActionContext {
            settings: settings.clone(),
            cluster: cluster.clone(),
            indices: indices.clone(),
            transport: transport.clone(),
            shard_state: shard_state.clone(),
        };
        let index_action = ReplicatedAction::register(
            IndexAction::new(indices.clone(), cluster.clone(), mapping_updater),
            ctx,
            &registry,
        );
        Ok(Arc::new(Self {
            settings,
            cluster,
            indices,
            registry,
            transport,
            shard_state,
            index_action,
        }))
    }

    /// Context for registering further actions on this node.
    pub fn action_context(&self) -> ActionContext {
        ActionContext {
            settings: self.settings.clone(),
            cluster: self.cluster.clone(),
            indices: self.indices.clone(),
            transport: self.transport.clone(),
            shard_state: self.shard_state.clone(),
        }
    }

    /// Stop serving: transport handlers report node-closed, observers wake.
    pub fn close(&self) {
        self.registry.close();
        self.cluster.close();
    }
}

/// Options for an in-process cluster.
#[derive(Debug, Clone)]
pub struct LocalClusterOptions {
    pub nodes: u64,
    pub default_write_consistency: WriteConsistencyLevel,
    pub shard_failure_timeout: Option<Duration>,
    pub executor_capacity: usize,
    pub data_dir: Option<PathBuf>,
}

impl Default for LocalClusterOptions {
    fn default() -> Self {
        Self {
            nodes: 3,
            default_write_consistency: WriteConsistencyLevel::Quorum,
            shard_failure_timeout: Some(Duration::from_secs(30)),
            executor_capacity: 64,
            data_dir: None,
        }
    }
}

/// Several nodes wired over an in-process mesh, with node 1 as the static
/// master.
pub struct LocalCluster {
    mesh: Arc<MeshTransport>,
    publisher: Arc<FanoutPublisher>,
    nodes: BTreeMap<NodeId, Arc<NodeState>>,
    master: NodeId,
    // Kept alive for the cluster's lifetime when no data dir was supplied.
    _temp_dir: Option<tempfile::TempDir>,
}

static INDEX_UUID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl LocalCluster {
    pub fn start(options: LocalClusterOptions) -> anyhow::Result<Self> {
        anyhow::ensure!(options.nodes > 0, "cluster needs at least one node");
        let (root, temp_dir) = match &options.data_dir {
            Some(dir) => (dir.clone(), None),
            None => {
                let temp = tempfile::tempdir().context("create cluster temp dir")?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };

        let master: NodeId = 1;
        let mut initial = ClusterState::new(1);
        for node_id in 1..=options.nodes {
            initial.nodes.add(DiscoveryNode::new(
                node_id,
                format!("node-{node_id}"),
                format!("local://{node_id}"),
            ));
        }

        let mesh = MeshTransport::new();
        let publisher = FanoutPublisher::new();
        let mut nodes = BTreeMap::new();
        for node_id in 1..=options.nodes {
            let mut settings = NodeSettings::new(node_id, master);
            settings.default_write_consistency = options.default_write_consistency;
            settings.shard_failure_timeout = options.shard_failure_timeout;
            settings.executor_capacity = options.executor_capacity;
            let node = NodeState::build(
                settings,
                initial.clone(),
                mesh.clone(),
                root.join(format!("node-{node_id}")),
            )?;
            mesh.register_node(node.registry.clone());
            publisher.add(node.cluster.clone());
            nodes.insert(node_id, node);
        }

        let master_node = nodes.get(&master).expect("master node built");
        MasterService::new(master_node.cluster.clone(), publisher.clone())
            .register(&master_node.registry);

        Ok(Self {
            mesh,
            publisher,
            nodes,
            master,
            _temp_dir: temp_dir,
        })
    }

    pub fn node(&self, node_id: NodeId) -> Arc<NodeState> {
        self.nodes.get(&node_id).expect("unknown node id").clone()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<NodeState>> {
        self.nodes.values()
    }

    pub fn master(&self) -> NodeId {
        self.master
    }

    pub fn mesh(&self) -> &Arc<MeshTransport> {
        &self.mesh
    }

    /// Latest state as the master sees it.
    pub fn state(&self) -> Arc<ClusterState> {
        self.node(self.master).cluster.state()
    }

    /// Mutate the master's state and broadcast the bumped successor.
    pub fn update_state(&self, mutate: impl FnOnce(&mut ClusterState)) {
        let mut state = self.state().as_ref().clone();
        mutate(&mut state);
        self.publisher.publish(state.bumped());
    }

    /// Create an index with started copies allocated round-robin across the
    /// nodes, create the shard copies on their hosts, and broadcast the
    /// routing.
    pub fn create_index(
        &self,
        name: &str,
        settings: IndexSettings,
    ) -> anyhow::Result<IndexMetadata> {
        let node_ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        let routing = allocate_routing(name, &settings, &node_ids);
        let uuid = INDEX_UUID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let metadata = IndexMetadata::new(name, format!("{name}-{uuid:08x}"), settings);
        self.install_index(metadata.clone(), routing)?;
        Ok(metadata)
    }

    /// Install an index with explicit routing: shard copies are created on
    /// every node the routing assigns, then the state is broadcast.
    pub fn install_index(
        &self,
        metadata: IndexMetadata,
        routing: IndexRoutingTable,
    ) -> anyhow::Result<()> {
        for shard_table in routing.shards() {
            for copy in shard_table.shards() {
                for node_id in [copy.current_node, copy.relocating_node].into_iter().flatten() {
                    let node = self
                        .nodes
                        .get(&node_id)
                        .ok_or_else(|| anyhow::anyhow!("routing references unknown node {node_id}"))?;
                    let index_service = node.indices.create_index(&metadata)?;
                    index_service.create_shard(copy.shard_id.shard)?;
                }
            }
        }
        self.update_state(move |state| {
            state.metadata.add_index(metadata);
            state.routing_table.add_index(routing);
        });
        Ok(())
    }
}

/// Round-robin allocation: shard `s` puts its primary on `nodes[s % n]` and
/// replicas on the following nodes. Replicas with no node left unassigned.
pub fn allocate_routing(
    index: &str,
    settings: &IndexSettings,
    nodes: &[NodeId],
) -> IndexRoutingTable {
    let mut table = IndexRoutingTable::new(index);
    for shard in 0..settings.number_of_shards.max(1) {
        let shard_id = ShardId::new(index, shard);
        let mut copies = Vec::new();
        for copy in 0..=settings.number_of_replicas {
            if (copy as usize) < nodes.len() {
                let node = nodes[(shard as usize + copy as usize) % nodes.len()];
                copies.push(ShardRouting::new(
                    shard_id.clone(),
                    copy == 0,
                    ShardRoutingState::Started,
                    node,
                ));
            } else {
                copies.push(ShardRouting::unassigned_copy(shard_id.clone(), copy == 0));
            }
        }
        table.add_shard(IndexShardRoutingTable::new(shard_id, copies));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("5h").is_err());
    }

    #[test]
    fn settings_keys() {
        let mut settings = NodeSettings::new(1, 1);
        settings.apply(WRITE_CONSISTENCY_SETTING, "all").unwrap();
        assert_eq!(settings.default_write_consistency, WriteConsistencyLevel::All);
        settings.apply(SHARD_FAILURE_TIMEOUT_SETTING, "10s").unwrap();
        assert_eq!(settings.shard_failure_timeout, Some(Duration::from_secs(10)));
        assert!(settings.apply("action.unknown", "x").is_err());
    }

    #[test]
    fn allocation_spreads_copies() {
        let settings = IndexSettings {
            number_of_shards: 2,
            number_of_replicas: 1,
            ..IndexSettings::default()
        };
        let table = allocate_routing("events", &settings, &[1, 2, 3]);
        let shard0 = table.shard(0).unwrap();
        assert_eq!(shard0.size(), 2);
        let primary = shard0.primary_shard().unwrap();
        assert_eq!(primary.current_node, Some(1));
        let replica = shard0.replica_shards().next().unwrap();
        assert_eq!(replica.current_node, Some(2));

        let shard1 = table.shard(1).unwrap();
        assert_eq!(shard1.primary_shard().unwrap().current_node, Some(2));
    }

    #[test]
    fn allocation_leaves_excess_replicas_unassigned() {
        let settings = IndexSettings {
            number_of_shards: 1,
            number_of_replicas: 2,
            ..IndexSettings::default()
        };
        let table = allocate_routing("events", &settings, &[1]);
        let shard = table.shard(0).unwrap();
        assert_eq!(shard.size(), 3);
        assert_eq!(shard.active_shard_count(), 1);
        assert_eq!(shard.replica_shards().filter(|s| s.unassigned()).count(), 2);
    }
}
