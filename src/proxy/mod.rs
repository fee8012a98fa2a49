//! Proxy layer: Turns registered tools into validated callables.
//!
//! - `validator`: schema-driven argument checks and coercion
//! - `result`: normalization of heterogeneous tool replies
//! - `generator`: one [`ProxyFunction`] per tool, plus the generator that owns them

pub mod generator;
pub mod result;
pub mod validator;

pub use generator::{
    GenerationDiff, ProxyFunction, ProxyFunctionMetadata, ProxyGenerator, ToolInvoker,
};
pub use result::ResultProcessor;
pub use validator::{ParamSpec, ParameterValidator};
