//! Web resources and their load state machine
//!
//! ```text
//!   New ──▶ WillReq ──▶ SoupReq ──▶ AddData ──▶ Finish
//!                          │          ▲   │
//!                          │          └───┘
//!                          └────────────────▶ Finish
//! ```
//!
//! Any other edge moves the resource to `Err`, which absorbs everything.

use log::warn;
use serde::Serialize;

use crate::domain::WspError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResKind {
    /// The page's main document
    Main,
    /// Any subresource; as a lookup key it matches every kind
    Any,
}

impl ResKind {
    /// Whether a resource of kind `self` satisfies a lookup for `query`
    #[must_use]
    pub fn matches(self, query: ResKind) -> bool {
        query == ResKind::Any || self == query
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResState {
    New,
    WillReq,
    SoupReq,
    AddData,
    Finish,
    Err,
}

impl ResState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ResState::New => "new",
            ResState::WillReq => "will_req",
            ResState::SoupReq => "soup_req",
            ResState::AddData => "add_data",
            ResState::Finish => "finish",
            ResState::Err => "err",
        }
    }

    fn allows(self, next: ResState) -> bool {
        matches!(
            (self, next),
            (ResState::New, ResState::WillReq)
                | (ResState::WillReq, ResState::SoupReq)
                | (ResState::SoupReq | ResState::AddData, ResState::AddData | ResState::Finish)
        )
    }
}

/// Coarse state of the page a thread is loading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    New,
    FinishMainLoad,
    Draw,
    Err,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WspResource {
    /// Address of the loader object in the target; compared, never read
    pub ptr: u64,
    pub id: u32,
    pub kind: ResKind,
    state: ResState,
}

impl WspResource {
    #[must_use]
    pub fn new(ptr: u64, id: u32, kind: ResKind) -> Self {
        Self { ptr, id, kind, state: ResState::New }
    }

    #[must_use]
    pub fn state(&self) -> ResState {
        self.state
    }

    #[must_use]
    pub fn is_err(&self) -> bool {
        self.state == ResState::Err
    }

    /// Move to `next`, or to `Err` if the edge is not legal
    ///
    /// # Errors
    /// [`WspError::IllegalTransition`]; the resource is in `Err` afterwards
    pub fn advance(&mut self, next: ResState) -> Result<(), WspError> {
        let from = self.state;
        if from.allows(next) {
            self.state = next;
            return Ok(());
        }
        if from != ResState::Err {
            warn!("Resource {} ({:#x}): illegal {} -> {}", self.id, self.ptr, from.name(), next.name());
            self.state = ResState::Err;
        }
        Err(WspError::IllegalTransition { id: self.id, from: from.name(), to: next.name() })
    }
}
