mod provider_configs;
mod sso_identities;
mod sso_sessions;
mod users;

pub use provider_configs::*;
pub use sso_identities::*;
pub use sso_sessions::*;
pub use users::*;
