//! Request authorization: rules, password bypass and the bypass cache

mod authorizer;
pub mod bypass;
pub mod challenge;
mod rules;

pub use authorizer::{Authorizer, Policy};
pub use bypass::BypassCache;
pub use challenge::BypassSecret;
pub use rules::{CompiledRule, RequestInfo, Rule, RuleAccess, RuleEngine, RuleType, Verdict};
