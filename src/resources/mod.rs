pub mod autoscaling;
pub mod core;
pub mod managedresources;
pub mod monitoring;
pub mod seeds;
pub mod shoots;
