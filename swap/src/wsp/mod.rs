//! Web page load tracking
//!
//! Entry probes on WebKit's resource loader reconstruct the lifecycle of
//! every resource a page loads and report it as `MSG_WSP` records.
//!
//! - [`res`]: per-resource state machine
//! - [`tracker`]: one tracking context per thread
//! - [`msg`]: record payload
//! - [`control`]: operator-facing control files and probe placement

pub mod control;
pub mod msg;
pub mod res;
pub mod tracker;

pub use control::{select_probes, AppInfo, ResolvedProbe, WspControl, WspProbe};
pub use msg::{WspEvent, WspMessage, WSP_MSG_LEN};
pub use res::{PageState, ResKind, ResState, WspResource};
pub use tracker::{ThreadData, WspTracker};
