//! Routing / service-discovery contracts.

/// Maps (service type, gid, hinted destination, version) to endpoint ids.
/// Concrete backends live outside the engine.
pub trait Routing {
    fn add_route(&self, svr_type: u32, node_id: u32, version: u32);
    fn del_route(&self, svr_type: u32, node_id: u32);
    fn is_node_exist(&self, node_id: u32, svr_type: u32) -> bool;
    fn node_num(&self, svr_type: u32, version: u32) -> usize;
    /// Final destination for a unicast, 0 when no route exists.
    fn send_dest(&self, svr_type: u32, gid: u64, expect_dest: u32, version: u32) -> u32;
    /// Every destination for a broadcast.
    fn all_send_dest(&self, svr_type: u32, world_id: u32, version: u32) -> Vec<u32>;
    fn clear(&self);
}

/// Service-mesh collaborator driven from loop phase 1.
pub trait ServiceMesh {
    /// Brings this instance online in the mesh.
    fn online(&self, inst_id: u32) -> bool;
    /// Takes this instance offline.
    fn offline(&self) -> bool;
    /// Pumps mesh events; returns how much work was done.
    fn process(&self) -> u32;
}
