// src/core/roles/mod.rs

//! Role management: the decision-engine seam, the group generator, and the
//! on-line role switcher.

pub mod decision;
pub mod groups;
pub mod switcher;

pub use decision::{
    EngineInputs, InstanceCollector, InstanceSnapshot, RatioEngine, RoleDecisionEngine,
    RoleManager,
};
pub use switcher::RoleSwitcher;
