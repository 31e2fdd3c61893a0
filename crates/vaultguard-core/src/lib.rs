pub mod audit;
pub mod engine;
pub mod identifier;
pub mod plan;
pub mod relation;
pub mod tuple;

pub use engine::{
    CheckRequest, CheckResponse, EngineError, ListObjectsRequest, PolicyEngine, ValidationError,
};
pub use identifier::{FormatError, ObjectType};
pub use plan::{PlanFeature, PlanLimits, PlanType, ResourceType};
pub use tuple::Tuple;
