pub mod app;
pub mod auth;
pub mod body;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod params;
pub mod ratelimit;
pub mod response;
pub mod schema;
pub mod upload;

pub use app::{App, AppState};
pub use endpoint::{Endpoint, EndpointBuilder, EndpointError, RequestContext};
pub use error::{ApiError, FieldErrors};
pub use params::{Param, ParamType, ParamValue};
pub use response::{ApiResponse, ResponseType};
pub use schema::{BodyModel, FieldRule, Hook};
