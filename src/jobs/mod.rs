//! Background maintenance jobs.
//!
//! - **Session cleanup**: purges expired SSO sessions on a fixed interval.
//!
//! ```toml
//! [session]
//! cleanup_interval_secs = 300
//! ```

mod session_cleanup;

pub use session_cleanup::{run_session_cleanup, start_session_cleanup_worker};
