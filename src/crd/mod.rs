//! Custom resources managed by the controller
//!
//! - `MachineDeployment` - desired state for a fleet of machines
//! - `MachineSet` - one template generation of a deployment

pub mod machine_deployment;
pub mod machine_set;
pub mod template;
