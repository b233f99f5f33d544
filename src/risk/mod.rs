//! Risk management (C4 pre-trade gate, C5 sizing, C5 flatten scheduler).

pub mod flatten;
pub mod gate;
pub mod sizing;

pub use flatten::FlattenScheduler;
pub use gate::{OrderIntent, RiskCheck, RiskGate};
pub use sizing::{recommend_position_size, BindingConstraint, SizingInput, SizingResult};
