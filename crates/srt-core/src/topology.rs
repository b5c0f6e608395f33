//! Resource allocation and process materialization
//!
//! Turns declarative role counts into a concrete placement: [`allocate_endpoints`]
//! packs logical endpoints onto a node pool, and [`endpoints_to_processes`] expands
//! every endpoint into one process per node with job-unique ports.

use crate::{Error, Result, WorkerRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Default base for system (control) ports
pub const DEFAULT_SYS_PORT_BASE: u16 = 8081;
/// Default base for leader HTTP ports
pub const DEFAULT_HTTP_PORT_BASE: u16 = 30000;
/// Default base for prefill bootstrap ports
pub const DEFAULT_BOOTSTRAP_PORT_BASE: u16 = 31000;
/// Default base for event-publishing ports
pub const DEFAULT_EVENT_PORT_BASE: u16 = 5550;
/// Default base for multi-node distributed init ports
pub const DEFAULT_DIST_INIT_PORT_BASE: u16 = 29500;

/// Per-role worker counts and GPU requirements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// GPU capacity of every node in the pool
    pub gpus_per_node: u32,
    pub prefill_workers: u32,
    pub decode_workers: u32,
    pub agg_workers: u32,
    pub gpus_per_prefill: u32,
    pub gpus_per_decode: u32,
    pub gpus_per_agg: u32,
}

impl ResourceRequest {
    /// Endpoint count and per-endpoint GPU need for a role
    pub fn demand(&self, role: WorkerRole) -> (u32, u32) {
        match role {
            WorkerRole::Prefill => (self.prefill_workers, self.gpus_per_prefill),
            WorkerRole::Decode => (self.decode_workers, self.gpus_per_decode),
            WorkerRole::Aggregated => (self.agg_workers, self.gpus_per_agg),
        }
    }

    /// Whether any aggregated workers are requested
    pub fn is_aggregated(&self) -> bool {
        self.agg_workers > 0
    }

    /// Expected (prefill, decode) counts for readiness.
    ///
    /// Aggregated workers register as decode-capable, so they are counted there.
    pub fn readiness_targets(&self) -> (u32, u32) {
        if self.is_aggregated() {
            (0, self.agg_workers)
        } else {
            (self.prefill_workers, self.decode_workers)
        }
    }

    /// Number of whole nodes the request occupies
    pub fn nodes_required(&self) -> Result<usize> {
        let gpn = self.gpus_per_node;
        if gpn == 0 {
            return Err(Error::config("gpus_per_node must be greater than zero"));
        }
        let mut total = 0usize;
        for role in WorkerRole::ALL {
            let (count, need) = self.demand(role);
            if count == 0 || need == 0 {
                continue;
            }
            if need >= gpn {
                total += (count * need.div_ceil(gpn)) as usize;
            } else {
                let per_node = gpn / need;
                total += count.div_ceil(per_node) as usize;
            }
        }
        Ok(total)
    }
}

/// A logical serving unit of one role, spanning one or more nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub role: WorkerRole,
    /// Index within its role
    pub index: u32,
    /// Nodes spanned, leader first
    pub nodes: Vec<String>,
    /// GPU indices claimed on every spanned node
    pub gpu_indices: BTreeSet<u32>,
    pub total_gpus: u32,
}

impl Endpoint {
    /// The first node, which hosts the leader process
    pub fn leader_node(&self) -> &str {
        &self.nodes[0]
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_multi_node(&self) -> bool {
        self.nodes.len() > 1
    }

    /// Name of the endpoint, e.g. `prefill_0`
    pub fn name(&self) -> String {
        format!("{}_{}", self.role, self.index)
    }
}

/// Cursor over the node pool shared by all roles
#[derive(Debug, Default)]
struct Cursor {
    node: usize,
    offset: u32,
}

impl Cursor {
    fn next_node(&mut self) {
        self.node += 1;
        self.offset = 0;
    }

    /// Move to a node boundary unless already on one
    fn align(&mut self) {
        if self.offset > 0 {
            self.next_node();
        }
    }
}

/// Pack role endpoints onto the node pool.
///
/// Roles are placed in order prefill, decode, aggregated. Endpoints that fit on
/// one node share nodes with endpoints of the same role; larger endpoints take
/// `ceil(need / gpus_per_node)` whole consecutive nodes. A node partially used by one role is never handed to
/// the next role. The result depends only on the inputs.
pub fn allocate_endpoints(request: &ResourceRequest, nodes: &[String]) -> Result<Vec<Endpoint>> {
    let gpn = request.gpus_per_node;
    if gpn == 0 {
        return Err(Error::config("gpus_per_node must be greater than zero"));
    }

    let mut cursor = Cursor::default();
    let mut endpoints = Vec::new();

    for role in WorkerRole::ALL {
        let (count, need) = request.demand(role);
        if count == 0 {
            continue;
        }
        if need == 0 {
            return Err(Error::config(format!(
                "{} workers requested but gpus per {} worker is zero",
                role, role
            )));
        }

        cursor.align();

        for index in 0..count {
            if need <= gpn {
                if cursor.offset + need > gpn {
                    cursor.next_node();
                }
                let node = nodes.get(cursor.node).ok_or_else(|| {
                    exhausted(role, index, request, nodes.len())
                })?;
                endpoints.push(Endpoint {
                    role,
                    index,
                    nodes: vec![node.clone()],
                    gpu_indices: (cursor.offset..cursor.offset + need).collect(),
                    total_gpus: need,
                });
                cursor.offset += need;
                if cursor.offset == gpn {
                    cursor.next_node();
                }
            } else {
                cursor.align();
                let span = need.div_ceil(gpn) as usize;
                let end = cursor.node + span;
                if end > nodes.len() {
                    return Err(exhausted(role, index, request, nodes.len()));
                }
                endpoints.push(Endpoint {
                    role,
                    index,
                    nodes: nodes[cursor.node..end].to_vec(),
                    gpu_indices: (0..gpn).collect(),
                    total_gpus: need,
                });
                cursor.node = end;
            }
        }
    }

    for endpoint in &endpoints {
        debug!(
            "Placed {} on {} GPUs {:?}",
            endpoint.name(),
            endpoint.nodes.join(","),
            endpoint.gpu_indices
        );
    }
    Ok(endpoints)
}

fn exhausted(role: WorkerRole, index: u32, request: &ResourceRequest, available: usize) -> Error {
    let required = request
        .nodes_required()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| "?".to_string());
    Error::insufficient(format!(
        "ran out of nodes placing {} worker {}: need {} nodes, have {}",
        role, index, required, available
    ))
}

/// Job-wide port counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLayout {
    pub sys_base: u16,
    pub http_base: u16,
    pub bootstrap_base: u16,
    pub event_base: u16,
    pub dist_init_base: u16,
}

impl Default for PortLayout {
    fn default() -> Self {
        Self::with_sys_base(DEFAULT_SYS_PORT_BASE)
    }
}

impl PortLayout {
    /// Default layout with a custom system port base
    pub fn with_sys_base(sys_base: u16) -> Self {
        Self {
            sys_base,
            http_base: DEFAULT_HTTP_PORT_BASE,
            bootstrap_base: DEFAULT_BOOTSTRAP_PORT_BASE,
            event_base: DEFAULT_EVENT_PORT_BASE,
            dist_init_base: DEFAULT_DIST_INIT_PORT_BASE,
        }
    }
}

/// Monotonic port counter that refuses to wrap
#[derive(Debug)]
struct PortCounter {
    kind: &'static str,
    base: u16,
    taken: u32,
}

impl PortCounter {
    fn new(kind: &'static str, base: u16) -> Self {
        Self { kind, base, taken: 0 }
    }

    fn take(&mut self) -> Result<u16> {
        let port = u16::try_from(u32::from(self.base) + self.taken)
            .map_err(|_| Error::config(format!("{} port range exhausted", self.kind)))?;
        self.taken += 1;
        Ok(port)
    }

    /// First and last port handed out
    fn used(&self) -> Option<(u16, u16)> {
        if self.taken == 0 {
            return None;
        }
        // take() never hands out a port past u16::MAX
        let last = u32::from(self.base) + self.taken - 1;
        Some((self.base, last as u16))
    }
}

/// Fail if two port kinds handed out overlapping ranges
fn check_disjoint(counters: &[&PortCounter]) -> Result<()> {
    let used: Vec<(&str, u16, u16)> = counters
        .iter()
        .filter_map(|c| c.used().map(|(lo, hi)| (c.kind, lo, hi)))
        .collect();
    for (i, &(kind_a, lo_a, hi_a)) in used.iter().enumerate() {
        for &(kind_b, lo_b, hi_b) in &used[i + 1..] {
            if lo_a <= hi_b && lo_b <= hi_a {
                return Err(Error::config(format!(
                    "{} ports {}-{} overlap {} ports {}-{}",
                    kind_a, lo_a, hi_a, kind_b, lo_b, hi_b
                )));
            }
        }
    }
    Ok(())
}

/// A physical worker process, one per node of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub role: WorkerRole,
    pub endpoint_index: u32,
    pub node: String,
    /// Position of this node within its endpoint
    pub node_rank: u32,
    /// Number of nodes in the owning endpoint
    pub endpoint_nodes: u32,
    /// Node hosting the endpoint leader
    pub leader_node: String,
    pub gpu_indices: BTreeSet<u32>,
    pub is_leader: bool,
    pub sys_port: u16,
    pub http_port: Option<u16>,
    pub bootstrap_port: Option<u16>,
    pub event_port: u16,
    /// Distributed init port shared by the endpoint, only for multi-node endpoints
    pub dist_init_port: Option<u16>,
}

impl Process {
    /// Registry name, e.g. `prefill_0_node-a`
    pub fn name(&self) -> String {
        format!("{}_{}_{}", self.role, self.endpoint_index, self.node)
    }

    /// Ascending comma-separated GPU indices
    pub fn cuda_visible_devices(&self) -> String {
        self.gpu_indices
            .iter()
            .map(|g| g.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn endpoint_name(&self) -> String {
        format!("{}_{}", self.role, self.endpoint_index)
    }
}

/// Expand endpoints into per-node processes with job-unique ports.
///
/// Each port kind counts up from its own base. The ranges actually handed out
/// must not overlap, otherwise the layout is rejected.
pub fn endpoints_to_processes(endpoints: &[Endpoint], layout: &PortLayout) -> Result<Vec<Process>> {
    let mut sys = PortCounter::new("system", layout.sys_base);
    let mut http = PortCounter::new("http", layout.http_base);
    let mut bootstrap = PortCounter::new("bootstrap", layout.bootstrap_base);
    let mut event = PortCounter::new("event", layout.event_base);
    let mut dist_init = PortCounter::new("dist-init", layout.dist_init_base);

    let mut processes = Vec::new();
    for endpoint in endpoints {
        let bootstrap_port = match endpoint.role {
            WorkerRole::Prefill => Some(bootstrap.take()?),
            _ => None,
        };
        let dist_init_port = if endpoint.is_multi_node() {
            Some(dist_init.take()?)
        } else {
            None
        };

        for (rank, node) in endpoint.nodes.iter().enumerate() {
            let is_leader = rank == 0;
            processes.push(Process {
                role: endpoint.role,
                endpoint_index: endpoint.index,
                node: node.clone(),
                node_rank: rank as u32,
                endpoint_nodes: endpoint.nodes.len() as u32,
                leader_node: endpoint.leader_node().to_string(),
                gpu_indices: endpoint.gpu_indices.clone(),
                is_leader,
                sys_port: sys.take()?,
                http_port: if is_leader { Some(http.take()?) } else { None },
                bootstrap_port,
                event_port: event.take()?,
                dist_init_port,
            });
        }
    }

    check_disjoint(&[&sys, &http, &bootstrap, &event, &dist_init])?;
    Ok(processes)
}

/// Placement computed once per job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub endpoints: Vec<Endpoint>,
    pub processes: Vec<Process>,
}

impl Topology {
    /// Allocate and materialize in one step
    pub fn plan(request: &ResourceRequest, nodes: &[String], layout: &PortLayout) -> Result<Self> {
        let endpoints = allocate_endpoints(request, nodes)?;
        let processes = endpoints_to_processes(&endpoints, layout)?;
        Ok(Self { endpoints, processes })
    }

    /// Processes of one endpoint, leader first
    pub fn processes_for<'a>(&'a self, endpoint: &'a Endpoint) -> impl Iterator<Item = &'a Process> {
        self.processes
            .iter()
            .filter(move |p| p.role == endpoint.role && p.endpoint_index == endpoint.index)
    }

    /// Leader processes of a role
    pub fn leaders(&self, role: WorkerRole) -> impl Iterator<Item = &Process> {
        self.processes.iter().filter(move |p| p.role == role && p.is_leader)
    }

    /// All nodes used by workers of a role, in placement order
    pub fn nodes_for_role(&self, role: WorkerRole) -> Vec<&str> {
        let mut nodes: Vec<&str> = Vec::new();
        for endpoint in self.endpoints.iter().filter(|e| e.role == role) {
            for node in &endpoint.nodes {
                if !nodes.contains(&node.as_str()) {
                    nodes.push(node);
                }
            }
        }
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn nodes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node{}", i)).collect()
    }

    fn request(p: u32, d: u32, a: u32, gp: u32, gd: u32, ga: u32, gpn: u32) -> ResourceRequest {
        ResourceRequest {
            gpus_per_node: gpn,
            prefill_workers: p,
            decode_workers: d,
            agg_workers: a,
            gpus_per_prefill: gp,
            gpus_per_decode: gd,
            gpus_per_agg: ga,
        }
    }

    fn set(v: &[u32]) -> BTreeSet<u32> {
        v.iter().copied().collect()
    }

    #[test]
    fn test_endpoints_share_node_within_role() {
        let eps = allocate_endpoints(&request(2, 2, 0, 2, 2, 8, 4), &nodes(2)).unwrap();
        assert_eq!(eps.len(), 4);

        assert_eq!(eps[0].role, WorkerRole::Prefill);
        assert_eq!(eps[0].nodes, vec!["node0"]);
        assert_eq!(eps[0].gpu_indices, set(&[0, 1]));
        assert_eq!(eps[1].nodes, vec!["node0"]);
        assert_eq!(eps[1].gpu_indices, set(&[2, 3]));

        assert_eq!(eps[2].role, WorkerRole::Decode);
        assert_eq!(eps[2].nodes, vec!["node1"]);
        assert_eq!(eps[2].gpu_indices, set(&[0, 1]));
        assert_eq!(eps[3].gpu_indices, set(&[2, 3]));
    }

    #[test]
    fn test_role_switch_skips_partial_node() {
        // one 1-GPU prefill leaves node0 mostly free, decode must still move on
        let eps = allocate_endpoints(&request(1, 1, 0, 1, 1, 0, 4), &nodes(2)).unwrap();
        assert_eq!(eps[0].nodes, vec!["node0"]);
        assert_eq!(eps[1].nodes, vec!["node1"]);
        assert_eq!(eps[1].gpu_indices, set(&[0]));

        let err = allocate_endpoints(&request(1, 1, 0, 1, 1, 0, 4), &nodes(1)).unwrap_err();
        assert!(matches!(err, Error::InsufficientResources(_)));
    }

    #[test]
    fn test_full_node_endpoints() {
        let eps = allocate_endpoints(&request(2, 2, 0, 4, 4, 0, 4), &nodes(4)).unwrap();
        assert_eq!(eps.len(), 4);
        for (i, ep) in eps.iter().enumerate() {
            assert_eq!(ep.nodes, vec![format!("node{}", i)]);
            assert_eq!(ep.total_gpus, 4);
        }
    }

    #[test]
    fn test_multi_node_endpoints() {
        let eps = allocate_endpoints(&request(1, 1, 0, 8, 8, 0, 4), &nodes(4)).unwrap();
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[0].nodes, vec!["node0", "node1"]);
        assert_eq!(eps[1].nodes, vec!["node2", "node3"]);
        for ep in &eps {
            assert_eq!(ep.total_gpus, 8);
            assert_eq!(ep.gpu_indices, set(&[0, 1, 2, 3]));
        }
    }

    #[test]
    fn test_multi_node_after_partial_node_aligns() {
        // 2-GPU prefill then 8-GPU decode: decode starts on a fresh node
        let eps = allocate_endpoints(&request(1, 1, 0, 2, 8, 0, 4), &nodes(3)).unwrap();
        assert_eq!(eps[0].nodes, vec!["node0"]);
        assert_eq!(eps[1].nodes, vec!["node1", "node2"]);
    }

    #[test]
    fn test_insufficient_gpus() {
        let err = allocate_endpoints(&request(2, 2, 0, 8, 8, 0, 4), &nodes(2)).unwrap_err();
        assert!(matches!(err, Error::InsufficientResources(_)));
    }

    #[test]
    fn test_single_endpoint_single_gpu() {
        let eps = allocate_endpoints(&request(1, 0, 0, 1, 1, 8, 4), &nodes(1)).unwrap();
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].role, WorkerRole::Prefill);
        assert_eq!(eps[0].total_gpus, 1);
        assert_eq!(eps[0].gpu_indices, set(&[0]));
    }

    #[test]
    fn test_aggregated_mode() {
        let eps = allocate_endpoints(&request(0, 0, 2, 4, 4, 4, 4), &nodes(2)).unwrap();
        assert_eq!(eps.len(), 2);
        for ep in &eps {
            assert_eq!(ep.role, WorkerRole::Aggregated);
            assert_eq!(ep.total_gpus, 4);
        }
    }

    #[test]
    fn test_invalid_requests() {
        let err = allocate_endpoints(&request(1, 0, 0, 2, 0, 0, 0), &nodes(2)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));

        let err = allocate_endpoints(&request(1, 0, 0, 0, 0, 0, 4), &nodes(2)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));

    }

    #[test]
    fn test_spanning_need_not_multiple_of_node_size() {
        let eps = allocate_endpoints(&request(1, 0, 0, 6, 0, 0, 4), &nodes(2)).unwrap();
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].nodes, vec!["node0", "node1"]);
        assert_eq!(eps[0].total_gpus, 6);
        assert_eq!(eps[0].gpu_indices, set(&[0, 1, 2, 3]));
        assert_eq!(request(1, 0, 0, 6, 0, 0, 4).nodes_required().unwrap(), 2);

        let err = allocate_endpoints(&request(1, 0, 0, 6, 0, 0, 4), &nodes(1)).unwrap_err();
        assert!(matches!(err, Error::InsufficientResources(_)));
    }

    #[test]
    fn test_roles_never_share_nodes_and_capacity_holds() {
        let gpn = 8;
        for gp in [1u32, 2, 3, 4, 8, 16] {
            for gd in [1u32, 2, 4, 8, 12, 16] {
                for (p, d) in [(1u32, 1u32), (2, 3), (3, 1), (4, 4)] {
                    let req = request(p, d, 0, gp, gd, 0, gpn);
                    let pool = nodes(req.nodes_required().unwrap());
                    let eps = allocate_endpoints(&req, &pool).unwrap();

                    let mut owner: HashMap<&str, WorkerRole> = HashMap::new();
                    let mut used: HashMap<&str, HashSet<u32>> = HashMap::new();
                    for ep in &eps {
                        assert_eq!(ep.num_nodes() as u32, ep.total_gpus.div_ceil(gpn));
                        for node in &ep.nodes {
                            let role = *owner.entry(node.as_str()).or_insert(ep.role);
                            assert_eq!(role, ep.role, "node {} shared across roles", node);
                            let claimed = used.entry(node.as_str()).or_default();
                            for gpu in &ep.gpu_indices {
                                assert!(*gpu < gpn);
                                assert!(claimed.insert(*gpu), "gpu {} on {} claimed twice", gpu, node);
                            }
                        }
                    }

                    // one node fewer must fail rather than under-allocate
                    let short = &pool[..pool.len() - 1];
                    assert!(allocate_endpoints(&req, short).is_err());
                }
            }
        }
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let req = request(3, 2, 0, 2, 4, 0, 8);
        let pool = nodes(4);
        let first = allocate_endpoints(&req, &pool).unwrap();
        let second = allocate_endpoints(&req, &pool).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_process_construction() {
        let eps = allocate_endpoints(&request(1, 1, 0, 2, 2, 0, 4), &nodes(2)).unwrap();
        let procs = endpoints_to_processes(&eps, &PortLayout::default()).unwrap();
        assert_eq!(procs.len(), 2);

        let sys: HashSet<u16> = procs.iter().map(|p| p.sys_port).collect();
        assert_eq!(sys.len(), 2);
        assert_eq!(procs[0].sys_port, 8081);
        assert_eq!(procs[0].name(), "prefill_0_node0");
        assert_eq!(procs[1].name(), "decode_0_node1");
    }

    #[test]
    fn test_multi_node_process_construction() {
        let eps = allocate_endpoints(&request(1, 0, 0, 8, 4, 8, 4), &nodes(2)).unwrap();
        let procs = endpoints_to_processes(&eps, &PortLayout::default()).unwrap();
        assert_eq!(procs.len(), 2);

        let leader = procs.iter().find(|p| p.is_leader).unwrap();
        let child = procs.iter().find(|p| !p.is_leader).unwrap();
        assert_eq!(leader.node, "node0");
        assert_eq!(child.node, "node1");
        assert_eq!(leader.http_port, Some(30000));
        assert_eq!(leader.bootstrap_port, Some(31000));
        assert_eq!(child.http_port, None);
        assert_eq!(child.bootstrap_port, leader.bootstrap_port);
        assert_eq!(child.node_rank, 1);
        assert_eq!(child.leader_node, "node0");
        assert_eq!(leader.dist_init_port, Some(29500));
        assert_eq!(child.dist_init_port, leader.dist_init_port);
    }

    #[test]
    fn test_ports_unique_across_job() {
        // mixes full-node, partial-node and multi-node endpoints
        let eps = allocate_endpoints(&request(2, 3, 0, 2, 8, 0, 4), &nodes(7)).unwrap();
        let procs = endpoints_to_processes(&eps, &PortLayout::default()).unwrap();

        let sys: HashSet<u16> = procs.iter().map(|p| p.sys_port).collect();
        let events: HashSet<u16> = procs.iter().map(|p| p.event_port).collect();
        let http: Vec<u16> = procs.iter().filter_map(|p| p.http_port).collect();
        assert_eq!(sys.len(), procs.len());
        assert_eq!(events.len(), procs.len());
        assert_eq!(http.iter().collect::<HashSet<_>>().len(), eps.len());

        for ep in &eps {
            let members: Vec<&Process> = procs
                .iter()
                .filter(|p| p.role == ep.role && p.endpoint_index == ep.index)
                .collect();
            assert_eq!(members.iter().filter(|p| p.is_leader).count(), 1);
            let bootstrap: HashSet<Option<u16>> = members.iter().map(|p| p.bootstrap_port).collect();
            assert_eq!(bootstrap.len(), 1);
            match ep.role {
                WorkerRole::Prefill => assert!(members[0].bootstrap_port.is_some()),
                _ => assert!(members[0].bootstrap_port.is_none()),
            }
        }
    }

    #[test]
    fn test_event_ports_sequential() {
        let eps = allocate_endpoints(&request(2, 2, 0, 2, 2, 0, 4), &nodes(2)).unwrap();
        let procs = endpoints_to_processes(&eps, &PortLayout::default()).unwrap();
        let events: Vec<u16> = procs.iter().map(|p| p.event_port).collect();
        assert_eq!(events, vec![5550, 5551, 5552, 5553]);
        assert_eq!(procs[0].http_port, Some(30000));
        assert_eq!(procs[1].http_port, Some(30001));
    }

    #[test]
    fn test_cuda_visible_devices() {
        let eps = allocate_endpoints(&request(2, 0, 0, 2, 0, 0, 4), &nodes(1)).unwrap();
        let procs = endpoints_to_processes(&eps, &PortLayout::default()).unwrap();
        assert_eq!(procs[0].cuda_visible_devices(), "0,1");
        assert_eq!(procs[1].cuda_visible_devices(), "2,3");
    }

    #[test]
    fn test_port_exhaustion() {
        let layout = PortLayout {
            sys_base: u16::MAX,
            ..PortLayout::default()
        };
        let eps = allocate_endpoints(&request(0, 2, 0, 0, 1, 0, 4), &nodes(1)).unwrap();
        assert!(endpoints_to_processes(&eps, &layout).is_err());
    }

    #[test]
    fn test_overlapping_port_ranges_rejected() {
        let eps = allocate_endpoints(&request(0, 2, 0, 0, 1, 0, 4), &nodes(1)).unwrap();

        // second decode leader takes http 30001, which is also the first system port
        let layout = PortLayout::with_sys_base(30001);
        let err = endpoints_to_processes(&eps, &layout).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert!(err.to_string().contains("overlap"));

        // touching but not overlapping is fine
        let layout = PortLayout::with_sys_base(30002);
        let procs = endpoints_to_processes(&eps, &layout).unwrap();
        assert_eq!(procs[0].sys_port, 30002);
        assert_eq!(procs[1].http_port, Some(30001));
    }

    #[test]
    fn test_dist_init_range_growing_into_http_rejected() {
        let layout = PortLayout {
            dist_init_base: DEFAULT_HTTP_PORT_BASE - 1,
            ..PortLayout::default()
        };
        let eps = allocate_endpoints(&request(0, 2, 0, 0, 8, 0, 4), &nodes(4)).unwrap();
        let err = Topology::plan(&request(0, 2, 0, 0, 8, 0, 4), &nodes(4), &layout).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));

        let one = &eps[..1];
        assert!(endpoints_to_processes(one, &layout).is_ok());
    }

    #[test]
    fn test_topology_plan() {
        let topo = Topology::plan(&request(1, 2, 0, 4, 2, 0, 4), &nodes(2), &PortLayout::default()).unwrap();
        assert_eq!(topo.endpoints.len(), 3);
        assert_eq!(topo.nodes_for_role(WorkerRole::Decode), vec!["node1"]);
        assert_eq!(topo.leaders(WorkerRole::Decode).count(), 2);
        let first = &topo.endpoints[0];
        assert_eq!(topo.processes_for(first).count(), 1);
    }

    #[test]
    fn test_readiness_targets() {
        assert_eq!(request(2, 4, 0, 1, 1, 0, 4).readiness_targets(), (2, 4));
        assert_eq!(request(0, 0, 3, 0, 0, 1, 4).readiness_targets(), (0, 3));
    }
}
