//! fleetgrid capacity translator.
//!
//! Pure functions that turn a [`ScalableGroup`](fleetgrid_store::ScalableGroup)
//! into something a claim can be matched against. Nothing here touches the
//! store; every function returns the same output for the same group state.
//!
//! # Components
//!
//! - **`labels`**: Label propagation policy and the scale-from-zero label parser
//! - **`requirements`**: Scheduling requirements and the compatibility check
//! - **`translate`**: Annotation → capacity, group → [`InstanceType`], resource fit

pub mod error;
pub mod labels;
pub mod requirements;
pub mod translate;

pub use error::{CapacityError, CapacityResult};
pub use labels::{LabelPolicy, parse_scale_from_zero_labels};
pub use requirements::{Requirement, Requirements};
pub use translate::{InstanceType, Offering, Overhead, capacity_from_annotations, fits, group_to_instance_type};
