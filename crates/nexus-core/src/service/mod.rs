pub mod topology;
pub mod topology_event;
