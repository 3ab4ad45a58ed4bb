mod provider_config;
mod role;
mod sso_session;
mod sso_user;
mod user;

pub use provider_config::*;
pub use role::*;
pub use sso_session::*;
pub use sso_user::*;
pub use user::*;
